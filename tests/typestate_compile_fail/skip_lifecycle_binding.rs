/// Hardening mount propagation before binding the lifecycle must not compile.

use gradebox::exec::preexec::{FreshChild, Sandbox};

fn main() {
    let sandbox = Sandbox::<FreshChild>::new("run".to_string(), true);

    // FreshChild has no harden_mount_propagation
    sandbox.harden_mount_propagation();
}
