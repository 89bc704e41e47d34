//! UID/GID transition to the sandbox identity.

mod transition;
mod validation;

pub use transition::transition_to_unprivileged;
pub use validation::validate_ids;
