pub mod credentials;
pub mod housekeeping;
pub mod progress;

pub use credentials::{password_digest, CredentialStore, InMemoryCredentialStore};
pub use housekeeping::SessionSweeper;
pub use progress::{ProgressEvent, ProgressReceiver, ProgressReporter};
