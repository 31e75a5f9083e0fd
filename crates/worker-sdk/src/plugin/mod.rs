// Plugin protocol shared by the worker (which spawns plugins) and plugin
// binaries (which serve it).

pub mod host;
pub mod protocol;

pub use host::{main, serve, ActionPlugin, PluginJob};
pub use protocol::{
    Frame, FrameReader, FrameWriter, Hello, JobDescriptor, LogFrame, Manifest, ParameterKind,
    ParameterSpec, PluginOutcome, PluginStatus, ProtocolError,
};
