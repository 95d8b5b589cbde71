use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("video source is neither an existing file nor a device index: {0:?}")]
    ParseVideoSource(String, #[source] std::num::ParseIntError),

    #[error("failed to canonicalize path: {1:?}")]
    CanonicalizePath(#[source] std::io::Error, PathBuf),

    #[error("failed to convert path to UTF-8 string: {0:?}")]
    PathToStr(PathBuf),

    #[error("failed to open video capture")]
    OpenCapture(#[source] opencv::Error),

    #[error("video capture for {0} is not opened")]
    CaptureNotOpened(String),

    #[error("failed to read frame from video capture")]
    ReadFrame(#[source] opencv::Error),

    #[error("failed to get video capture property {0}")]
    GetCaptureProperty(i32, #[source] opencv::Error),

    #[error("failed to release video capture")]
    ReleaseCapture(#[source] opencv::Error),

    #[error("failed to convert value to i32")]
    ConvertToI32,

    #[error("failed to convert value to f64")]
    ConvertToF64,

    #[error("failed to convert dim i32 to usize")]
    ConvertDimI32ToUSize(#[source] std::num::TryFromIntError),

    #[error("failed to convert dim usize to i32")]
    ConvertDimUSizeToI32(#[source] std::num::TryFromIntError),

    #[error("got an empty frame")]
    EmptyFrame,

    #[error("expected an 8-bit 3-channel frame, got Mat type {typ} ({channels} channels)")]
    FrameType { typ: i32, channels: i32 },

    #[error("failed to resize frame")]
    Resize(#[source] opencv::Error),

    #[error("failed to convert frame color space")]
    CvtColor(#[source] opencv::Error),

    #[error("failed to get Mat data")]
    GetMatData(#[source] opencv::Error),

    #[error("failed to construct Mat")]
    ConstructMat(#[source] opencv::Error),

    #[error("failed to construct array view from Mat data")]
    ConstructArrayView(#[source] ndarray::ShapeError),

    #[error("expected model output of shape [N, 1|3, H, W] with N >= 1, got {0:?}")]
    OutputShape(Vec<usize>),

    #[error("model file does not exist: {0:?}")]
    ModelNotFound(PathBuf),

    #[error("failed to create session builder: {0}")]
    CreateSessionBuilder(String),

    #[error("failed to load model from {1:?}: {0}")]
    LoadModel(String, PathBuf),

    #[error("model graph has no {0}")]
    MissingGraphIo(&'static str),

    #[error("execution device is not supported by this build: gpu {0}")]
    UnsupportedDevice(i32),

    #[error("inference was requested before any input was set")]
    MissingInput,

    #[error("failed to create input tensor: {0}")]
    CreateInputTensor(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("failed to extract output tensor {0}: {1}")]
    ExtractOutput(String, String),

    #[error("failed to create window {1}")]
    NamedWindow(#[source] opencv::Error, String),

    #[error("failed to show image")]
    ImShow(#[source] opencv::Error),

    #[error("failed waiting for key press")]
    WaitKey(#[source] opencv::Error),

    #[error("failed to destroy windows")]
    DestroyWindows(#[source] opencv::Error),

    #[error("failed to compute fourcc code")]
    FourCc(#[source] opencv::Error),

    #[error("failed to open video writer for {1:?}")]
    OpenWriter(#[source] opencv::Error, PathBuf),

    #[error("video writer for {0:?} is not opened")]
    WriterNotOpened(PathBuf),

    #[error("failed to write frame")]
    WriteFrame(#[source] opencv::Error),

    #[error("failed to release video writer")]
    ReleaseWriter(#[source] opencv::Error),

    #[error("cannot derive an output path from video source {0:?}")]
    DeriveOutputPath(PathBuf),
}
