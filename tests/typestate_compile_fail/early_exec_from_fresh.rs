/// Exec straight from a fresh child must not compile.

use gradebox::exec::preexec::{FreshChild, Sandbox};

fn main() {
    let sandbox = Sandbox::<FreshChild>::new("run".to_string(), true);

    // FreshChild has no exec_payload
    sandbox.exec_payload(&["/bin/true".to_string()]);
}
