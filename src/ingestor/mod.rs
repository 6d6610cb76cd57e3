pub mod epg_parser;
pub mod m3u_parser;
pub mod pipeline;

pub use epg_parser::{
    EpgParseHandle, EpgParseOutput, EpgParser, EpgProgress, EpgWorkerMessage,
};
pub use m3u_parser::M3uParser;
pub use pipeline::{EpgSourceRequest, IngestionPipeline, PlaylistIngestRequest};
