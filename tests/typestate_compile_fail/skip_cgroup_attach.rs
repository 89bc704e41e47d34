/// Building the jail before the cgroup attach must not compile.

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
        .expect("propagation");

    // MountsPrivate has no setup_mounts_and_root
    sandbox.setup_mounts_and_root(&profile());
}
