/// Dropping credentials before the jail exists must not compile.

use gradebox::exec::preexec::{FreshChild, Sandbox};

fn main() {
    let sandbox = Sandbox::<FreshChild>::new("run".to_string(), true)
        .bind_lifecycle(true)
        .expect("lifecycle")
        .harden_mount_propagation()
        .expect("propagation")
        .attach_to_cgroup(None)
        .expect("cgroup");

    // CgroupAttached has no drop_credentials
    sandbox.drop_credentials(Some(65534), Some(65534));
}
