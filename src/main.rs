use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use opencv::core::Size;
use std::{
    num::NonZeroU16,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use structopt::StructOpt;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

mod convert;
mod driver;
mod error;
mod model;
mod sink;
mod source;

use convert::InputScale;
use driver::{Driver, Summary};
use model::{Checkpoint, OnnxGenerator, Translator};
use sink::{FileSink, WindowSink};
use source::{Capture, FrameSource, VideoSource};

#[derive(Debug, structopt::StructOpt)]
struct Opt {
    /// A video file, or the index of a camera device.
    #[structopt(long, default_value = "0")]
    videosource: String,

    /// Write translated frames to `<source>_style.mov` instead of displaying them.
    #[structopt(long)]
    save: bool,

    /// Use the model in eval mode.
    #[structopt(long)]
    eval: bool,

    /// Path to an ONNX generator. Overrides the checkpoint options.
    #[structopt(short, long)]
    model: Option<PathBuf>,

    /// Models are saved here.
    #[structopt(long, default_value = "./checkpoints")]
    checkpoints_dir: PathBuf,

    /// Name of the experiment. It decides where to load models from.
    #[structopt(long, default_value = "experiment_name")]
    name: String,

    /// Which epoch to load.
    #[structopt(long, default_value = "latest")]
    epoch: String,

    /// Which network of the experiment to load.
    #[structopt(long, default_value = "G")]
    net: String,

    /// Map input pixels to [-1, 1] instead of feeding raw intensities.
    #[structopt(long)]
    normalize: bool,

    /// The width of the displayed output.
    #[structopt(long, default_value = "512")]
    display_width: NonZeroU16,

    /// The height of the displayed output.
    #[structopt(long, default_value = "512")]
    display_height: NonZeroU16,

    /// Where to write the translated video in save mode.
    #[structopt(short, long)]
    output: Option<PathBuf>,

    #[structopt(short = "-W", long, default_value = "1")]
    wait_key_ms: i32,

    /// Run the model on this CUDA device.
    #[structopt(long)]
    gpu_id: Option<i32>,

    #[structopt(short, long, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    #[structopt(short, long)]
    show_progress: bool,
}

impl Opt {
    fn checkpoint(&self) -> Checkpoint {
        match &self.model {
            Some(path) => Checkpoint::File(path.clone()),
            None => Checkpoint::Experiment {
                dir: self.checkpoints_dir.clone(),
                name: self.name.clone(),
                epoch: self.epoch.clone(),
                net: self.net.clone(),
            },
        }
    }

    fn input_scale(&self) -> InputScale {
        if self.normalize {
            InputScale::Symmetric
        } else {
            InputScale::Raw
        }
    }

    fn display_size(&self) -> Size {
        Size::new(
            i32::from(self.display_width.get()),
            i32::from(self.display_height.get()),
        )
    }

    /// The output file when running in save mode, `None` for display mode.
    fn save_path(&self, source: &VideoSource) -> Result<Option<PathBuf>, error::Error> {
        match (self.save, source.as_file()) {
            (false, _) => Ok(None),
            (true, None) => {
                warn!(
                    message = "saving requires a video file source, displaying instead",
                    %source
                );
                Ok(None)
            }
            (true, Some(path)) => match &self.output {
                Some(output) => Ok(Some(output.clone())),
                None => sink::styled_output_path(path).map(Some),
            },
        }
    }
}

fn progress_bar(len: Option<u64>) -> ProgressBar {
    match len {
        Some(len) => ProgressBar::new(len).with_style(
            ProgressStyle::default_bar()
                .template("{prefix:.bold.dim} {bar:40} {pos}/{len} {wide_msg}"),
        ),
        None => ProgressBar::new_spinner().with_style(
            ProgressStyle::default_spinner()
                .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ")
                .template("{prefix:.bold.dim} {spinner} {wide_msg}"),
        ),
    }
}

fn main() -> Result<()> {
    let opt = Opt::from_args();

    tracing::subscriber::set_global_default(
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(
                EnvFilter::try_new(&opt.log_level)
                    .with_context(|| format!("invalid log filter: {}", opt.log_level))?,
            ),
    )?;

    let running = Arc::new(AtomicBool::new(true));
    let running_ctrl_c = running.clone();

    ctrlc::set_handler(move || {
        running_ctrl_c.store(false, Ordering::SeqCst);
    })
    .context("failed setting Ctrl-C handler")?;

    let model_path = opt
        .checkpoint()
        .resolve()
        .context("failed to locate generator")?;
    info!(message = "loading generator", path = %model_path.display());
    let mut model =
        OnnxGenerator::new(&model_path, opt.gpu_id).context("failed constructing generator")?;
    if opt.eval {
        model.eval();
    }

    let source = VideoSource::resolve(&opt.videosource).context("failed resolving video source")?;
    let capture = Capture::open(&source).context("failed opening video source")?;

    let frame_size = capture
        .frame_size()
        .context("failed getting source frame dimensions")?;
    let fps = capture.fps().context("failed getting source frame rate")?;
    info!(
        message = "got dimensions from video capture",
        %source,
        width = frame_size.width,
        height = frame_size.height,
        fps
    );

    let save_path = opt.save_path(&source)?;

    let progress = if opt.show_progress {
        let len = capture
            .frame_count()
            .context("failed getting source frame count")?;
        Some(progress_bar(save_path.as_ref().and(len)))
    } else {
        None
    };

    let summary = match save_path {
        Some(path) => {
            let sink = FileSink::create(&path, fps, frame_size)
                .context("failed opening output video")?;
            info!(message = "saving translated video", path = %sink.path().display());
            run(
                Driver::new(capture, sink, model, frame_size, opt.input_scale()),
                running,
                progress,
            )?
        }
        None => {
            let sink = WindowSink::new(opt.wait_key_ms).context("failed opening windows")?;
            run(
                Driver::new(capture, sink, model, opt.display_size(), opt.input_scale()),
                running,
                progress,
            )?
        }
    };

    info!(
        message = "done",
        frames = summary.frames,
        exit = ?summary.exit,
        seconds = summary.timing.total.as_secs_f64()
    );
    Ok(())
}

fn run<S, K, T>(
    driver: Driver<S, K, T>,
    running: Arc<AtomicBool>,
    progress: Option<ProgressBar>,
) -> Result<Summary>
where
    S: source::FrameSource,
    K: sink::FrameSink,
    T: Translator,
{
    let driver = driver.with_running(running);
    let driver = match progress {
        Some(progress) => driver.with_progress(progress),
        None => driver,
    };
    driver.run().context("failed running translation loop")
}
