pub mod model;
pub mod parser;
pub mod rewrite;
pub mod writer;

pub use model::SshConfigFile;
pub use parser::{ParseError, ParseErrorKind};
pub use rewrite::{CredentialIntent, RewriteSummary};
pub use writer::{WriteError, atomic_write, atomic_write_with};
