use crate::dsl::SyntaxError;
use crate::engine::RunFailure;
use crate::registry::BuildError;

/// Any failure from loading or running a program.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Run(#[from] RunFailure),

    #[error("could not read program: {0}")]
    Io(#[from] std::io::Error),
}
