//! Backend adapters: the concrete integrations that let the broker talk
//! to a subprocess CLI, a remote HTTP/SSE service, or a local process that
//! must announce readiness before use — all behind the single
//! [`traits::BackendAdapter`] seam.

pub mod git;
pub mod http_sse;
pub mod process_listen;
pub mod subprocess;
pub mod traits;
pub mod translators;

pub use git::{CliGitInfoResolver, GitInfoResolver, NoopGitInfoResolver};
pub use http_sse::HttpSseAdapter;
pub use process_listen::ProcessListenAdapter;
pub use subprocess::SubprocessAdapter;
pub use traits::{adapter_io_error, mask_secrets, BackendAdapter, BackendHandle};
