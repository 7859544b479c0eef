#![cfg_attr(not(test), warn(clippy::unwrap_used))]

pub mod config;
pub mod detect;
pub mod emitter;
pub mod fetcher;
pub mod logger;
pub mod metadata;
pub mod parser;
pub mod registry;
pub mod reporter;
pub mod source;
pub mod status;
pub mod temp;
pub mod tuple;

pub use config::Config;
pub use metadata::Metadata;
pub use registry::Registry;

pub mod prelude {
    use super::*;

    pub use emitter::{AttachmentStrategy, EmitRecord, Emitter};
    pub use fetcher::{FetchStream, Fetcher};
    pub use metadata::Metadata;
    pub use parser::{CompositeParser, ParseContext, Parser};
    pub use reporter::Reporter;
    pub use source::TupleSource;
    pub use status::{PipesResult, Status, TotalCount, TotalCountStatus};
    pub use tuple::{EmitKey, FetchEmitTuple, FetchKey, OnParseError};
}
