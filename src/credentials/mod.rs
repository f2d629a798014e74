//! Credential records, persistence, and the validation gate

pub mod record;
pub mod store;
pub mod validator;

pub use record::{CredentialRecord, REQUIRED_COOKIES};
pub use store::{CredentialStore, SaveOutcome, SaveReceipt, CREDENTIAL_TTL_SECS};
pub use validator::{CredentialValidator, ValidatedIdentity};
