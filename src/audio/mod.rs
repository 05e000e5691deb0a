pub mod constants;
pub mod encoder;
pub mod pipeline;
pub mod process;
pub mod volume;

pub use encoder::FrameEncoder;
pub use pipeline::{
    FfmpegPipelineFactory, FramePoll, FrameSource, PipelineError, PipelineFactory,
    TranscodePipeline,
};
pub use process::{StreamLocator, TranscodeProcess, ffmpeg_args};
pub use volume::VolumeHandle;
