pub mod direct;
pub mod fragment;
pub mod provider;
pub mod proxied;
pub mod proxy_service;
pub mod selector;

pub use direct::HttpSpeechProvider;
pub use fragment::{collapse_whitespace, FragmentNormalizer, RawFragment, TranscriptFragment};
pub use provider::{SpeechProvider, SpeechStream};
pub use proxied::FabricSpeechProvider;
pub use proxy_service::ProxyService;
pub use selector::{Acquisition, AcquisitionPath, AcquisitionSelector, PathState, UpdateSink};
