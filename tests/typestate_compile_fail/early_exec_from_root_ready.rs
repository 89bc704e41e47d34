/// Exec from inside the jail, before hygiene and the credential drop, must not compile.

use gradebox::core::types::ExecutionProfile;
use gradebox::exec::preexec::{FreshChild, Sandbox};

fn profile() -> ExecutionProfile {
    unimplemented!()
}

fn main() {
    let sandbox = Sandbox::<FreshChild>::new("run".to_string(), true)
        .bind_lifecycle(true)
        .expect("lifecycle")
        .harden_mount_propagation()
        .expect("propagation")
        .attach_to_cgroup(None)
        .expect("cgroup")
        .setup_mounts_and_root(&profile())
        .expect("jail");

    // RootReady has no exec_payload
    sandbox.exec_payload(&["/bin/true".to_string()]);
}
