//! Recording fakes for the server's external boundaries

mod dispatcher;
mod loader;

pub use dispatcher::{DispatchRecord, RecordingJobDispatcher, RecordingVerificationRunner, VerificationRecord};
pub use loader::StaticInitialStateLoader;
