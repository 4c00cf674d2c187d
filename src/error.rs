/// The primary error type of this crate.
///
/// Only the poll backends produce errors; the dispatch engine itself
/// communicates through booleans, and callback failures are not
/// represented.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An error from the underlying OS readiness primitive.
    #[error("underlying IO error")]
    Io(#[from] std::io::Error),
}

impl From<nix::errno::Errno> for Error {
    fn from(err: nix::errno::Errno) -> Self {
        Into::<std::io::Error>::into(err).into()
    }
}

/// Result alias for operations that can fail with [`Error`].
pub type Result<T> = core::result::Result<T, Error>;
