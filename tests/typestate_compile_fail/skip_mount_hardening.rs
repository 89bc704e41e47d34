/// Attaching to the cgroup with shared mount propagation must not compile.

use gradebox::exec::preexec::{FreshChild, Sandbox};

fn main() {
    let sandbox = Sandbox::<FreshChild>::new("run".to_string(), true)
        .bind_lifecycle(true)
        .expect("lifecycle");

    // NamespacesReady has no attach_to_cgroup
    sandbox.attach_to_cgroup(None);
}
