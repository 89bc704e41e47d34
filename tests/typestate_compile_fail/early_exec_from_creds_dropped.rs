/// Exec with credentials dropped but privileges still unlocked must not compile.

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
        .expect("jail")
        .apply_runtime_hygiene(&profile(), &[3])
        .expect("hygiene")
        .drop_credentials(Some(65534), Some(65534))
        .expect("credentials");

    // CredsDropped has no exec_payload; no_new_privs comes first
    sandbox.exec_payload(&["/bin/true".to_string()]);
}
