/// A state consumed by its transition cannot be used again.

use gradebox::exec::preexec::{FreshChild, Sandbox};

fn main() {
    let sandbox = Sandbox::<FreshChild>::new("run".to_string(), true);

    let _next = sandbox.bind_lifecycle(true).expect("lifecycle");

    // sandbox was moved by bind_lifecycle
    sandbox.bind_lifecycle(true);
}
