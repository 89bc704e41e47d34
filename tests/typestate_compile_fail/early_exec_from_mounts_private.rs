/// Exec after mount hardening, before the cgroup attach, must not compile.

use gradebox::exec::preexec::{FreshChild, Sandbox};

fn main() {
    let sandbox = Sandbox::<FreshChild>::new("run".to_string(), true)
        .bind_lifecycle(true)
        .expect("lifecycle")
        .harden_mount_propagation()
        .expect("propagation");

    // MountsPrivate has no exec_payload
    sandbox.exec_payload(&["/bin/true".to_string()]);
}
