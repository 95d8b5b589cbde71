use crate::{
    convert::{self, InputScale},
    error::Error,
    model::Translator,
    sink::FrameSink,
    source::FrameSource,
};
use indicatif::ProgressBar;
use num_traits::cast::ToPrimitive;
use opencv::core::{Mat, Size};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::{info, trace, warn};

#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct Timing {
    pub(crate) capture: Duration,
    pub(crate) inference: Duration,
    pub(crate) total: Duration,
}

/// Why the loop stopped.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Exit {
    /// The source had no more frames, or failed to produce one.
    CaptureFailed,
    /// The user pressed a quit key.
    Quit,
    /// The process was asked to stop, e.g. by Ctrl-C.
    Interrupted,
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct Summary {
    pub(crate) frames: usize,
    pub(crate) exit: Exit,
    pub(crate) timing: Timing,
}

/// The capture, translate, present loop.
pub(crate) struct Driver<S, K, T> {
    source: S,
    sink: K,
    model: T,
    output_size: Size,
    scale: InputScale,
    running: Arc<AtomicBool>,
    progress: Option<ProgressBar>,
}

impl<S, K, T> Driver<S, K, T>
where
    S: FrameSource,
    K: FrameSink,
    T: Translator,
{
    pub(crate) fn new(source: S, sink: K, model: T, output_size: Size, scale: InputScale) -> Self {
        Self {
            source,
            sink,
            model,
            output_size,
            scale,
            running: Arc::new(AtomicBool::new(true)),
            progress: None,
        }
    }

    /// Stop between frames once `running` is cleared.
    pub(crate) fn with_running(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = running;
        self
    }

    pub(crate) fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Run until the source is exhausted, the user quits or `running` is cleared.
    ///
    /// The source and sink are released exactly once on every path out of
    /// the loop, including when a step fails.
    pub(crate) fn run(mut self) -> Result<Summary, Error> {
        let mut timing = Timing::default();
        let mut frames = 0;
        let result = self.run_frames(&mut timing, &mut frames);

        let released = self.release();
        if let Some(progress) = self.progress.take() {
            progress.finish_and_clear();
        }

        if let (Err(_), Err(error)) = (&result, &released) {
            tracing::error!(message = "failed to release after the loop failed", %error);
        }
        let exit = result?;
        released?;

        info!(
            message = "finished",
            frames,
            exit = ?exit,
            capture_ms = timing.capture.as_millis() as u64,
            inference_ms = timing.inference.as_millis() as u64,
        );
        Ok(Summary {
            frames,
            exit,
            timing,
        })
    }

    fn release(&mut self) -> Result<(), Error> {
        // release both before reporting either failure
        let source = self.source.release();
        let sink = self.sink.release();
        source.and(sink)
    }

    fn run_frames(&mut self, timing: &mut Timing, frames: &mut usize) -> Result<Exit, Error> {
        let start = Instant::now();
        let mut input_frame = Mat::default();

        let exit = loop {
            if !self.running.load(Ordering::SeqCst) {
                break Exit::Interrupted;
            }

            let capture_start = Instant::now();
            if !self.source.read(&mut input_frame)? {
                warn!(message = "could not get an image, check the video source");
                break Exit::CaptureFailed;
            }
            timing.capture += capture_start.elapsed();

            self.sink.show_input(&input_frame)?;

            let input = convert::preprocess(&input_frame, self.scale)?;
            self.model.set_input(input);

            let inference_start = Instant::now();
            self.model.test()?;
            let inference = inference_start.elapsed();
            timing.inference += inference;

            let output = self.model.current_output().ok_or(Error::MissingInput)?;
            let output_frame = convert::postprocess(output, self.output_size)?;
            self.sink.write_output(&output_frame)?;

            *frames += 1;
            trace!(frame = *frames, inference_us = inference.as_micros() as u64);
            self.report(*frames, timing)?;

            if self.sink.poll_quit()? {
                info!(message = "quit key pressed");
                break Exit::Quit;
            }
        };

        timing.total = start.elapsed();
        Ok(exit)
    }

    fn report(&self, frames: usize, timing: &Timing) -> Result<(), Error> {
        if let Some(progress) = self.progress.as_ref() {
            let frames = frames.to_f64().ok_or(Error::ConvertToF64)?;
            progress.set_message(format!(
                "FPS => model: {:.1}, cam: {:.1}",
                frames / timing.inference.as_secs_f64(),
                frames / timing.capture.as_secs_f64(),
            ));
            progress.inc(1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Driver, Exit};
    use crate::{
        convert::{tests::solid_frame, InputScale},
        error::Error,
        model::Translator,
        sink::{
            tests::{mjpg_writer, scratch_path, written_video_stats},
            FileSink, FrameSink,
        },
        source::FrameSource,
    };
    use ndarray::{Array4, ArrayD, ArrayViewD, IxDyn};
    use opencv::{
        core::{Mat, Size},
        prelude::*,
    };
    use std::{
        cell::Cell,
        rc::Rc,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    };

    #[derive(Default)]
    struct Counters {
        reads: Cell<usize>,
        source_releases: Cell<usize>,
        inferences: Cell<usize>,
        shown: Cell<usize>,
        written: Cell<usize>,
        sink_releases: Cell<usize>,
        written_sizes: std::cell::RefCell<Vec<Size>>,
    }

    struct FakeSource {
        remaining: usize,
        size: Size,
        fail_release: bool,
        counters: Rc<Counters>,
    }

    impl FrameSource for FakeSource {
        fn read(&mut self, frame: &mut Mat) -> Result<bool, Error> {
            self.counters.reads.set(self.counters.reads.get() + 1);
            if self.remaining == 0 {
                return Ok(false);
            }
            self.remaining -= 1;
            *frame = solid_frame(self.size.width, self.size.height, (0, 128, 255));
            Ok(true)
        }

        fn frame_size(&self) -> Result<Size, Error> {
            Ok(self.size)
        }

        fn fps(&self) -> Result<f64, Error> {
            Ok(25.0)
        }

        fn frame_count(&self) -> Result<Option<u64>, Error> {
            Ok(None)
        }

        fn release(&mut self) -> Result<(), Error> {
            self.counters
                .source_releases
                .set(self.counters.source_releases.get() + 1);
            if self.fail_release {
                return Err(Error::CaptureNotOpened("fake".into()));
            }
            Ok(())
        }
    }

    /// Quits after `quit_after` written frames when set, fails writes when `fail_write` is set.
    struct FakeSink {
        quit_after: Option<usize>,
        fail_write: bool,
        counters: Rc<Counters>,
    }

    impl FrameSink for FakeSink {
        fn show_input(&mut self, _frame: &Mat) -> Result<(), Error> {
            self.counters.shown.set(self.counters.shown.get() + 1);
            Ok(())
        }

        fn write_output(&mut self, frame: &Mat) -> Result<(), Error> {
            if self.fail_write {
                return Err(Error::WriterNotOpened("fake".into()));
            }
            self.counters.written.set(self.counters.written.get() + 1);
            self.counters
                .written_sizes
                .borrow_mut()
                .push(frame.size().unwrap());
            Ok(())
        }

        fn poll_quit(&mut self) -> Result<bool, Error> {
            Ok(self
                .quit_after
                .map_or(false, |n| self.counters.written.get() >= n))
        }

        fn release(&mut self) -> Result<(), Error> {
            self.counters
                .sink_releases
                .set(self.counters.sink_releases.get() + 1);
            Ok(())
        }
    }

    /// Returns a mid-gray image of the staged input's spatial size.
    struct FakeModel {
        input: Option<Array4<f32>>,
        output: Option<ArrayD<f32>>,
        counters: Rc<Counters>,
    }

    impl Translator for FakeModel {
        fn set_input(&mut self, input: Array4<f32>) {
            self.input = Some(input);
        }

        fn test(&mut self) -> Result<(), Error> {
            let input = self.input.as_ref().ok_or(Error::MissingInput)?;
            self.counters
                .inferences
                .set(self.counters.inferences.get() + 1);
            self.output = Some(ArrayD::zeros(IxDyn(input.shape())));
            Ok(())
        }

        fn current_output(&self) -> Option<ArrayViewD<'_, f32>> {
            self.output.as_ref().map(|output| output.view())
        }

        fn eval(&mut self) {}
    }

    fn source(frames: usize, size: Size, counters: &Rc<Counters>) -> FakeSource {
        FakeSource {
            remaining: frames,
            size,
            fail_release: false,
            counters: counters.clone(),
        }
    }

    fn model(counters: &Rc<Counters>) -> FakeModel {
        FakeModel {
            input: None,
            output: None,
            counters: counters.clone(),
        }
    }

    fn driver(
        frames: usize,
        source_size: Size,
        output_size: Size,
        quit_after: Option<usize>,
        fail_write: bool,
    ) -> (Driver<FakeSource, FakeSink, FakeModel>, Rc<Counters>) {
        let counters = Rc::new(Counters::default());
        let driver = Driver::new(
            source(frames, source_size, &counters),
            FakeSink {
                quit_after,
                fail_write,
                counters: counters.clone(),
            },
            model(&counters),
            output_size,
            InputScale::Raw,
        );
        (driver, counters)
    }

    #[test]
    fn capture_failure_skips_inference_and_releases() {
        let (driver, counters) = driver(0, Size::new(640, 480), Size::new(640, 480), None, false);
        let summary = driver.run().unwrap();

        assert_eq!(summary.exit, Exit::CaptureFailed);
        assert_eq!(summary.frames, 0);
        assert_eq!(counters.reads.get(), 1);
        assert_eq!(counters.inferences.get(), 0);
        assert_eq!(counters.written.get(), 0);
        assert_eq!(counters.source_releases.get(), 1);
        assert_eq!(counters.sink_releases.get(), 1);
    }

    #[test]
    fn save_mode_writes_every_frame_at_source_size() {
        const N: usize = 9;
        let size = Size::new(320, 180);
        let (driver, counters) = driver(N, size, size, None, false);
        let summary = driver.run().unwrap();

        assert_eq!(summary.exit, Exit::CaptureFailed);
        assert_eq!(summary.frames, N);
        assert_eq!(counters.inferences.get(), N);
        assert_eq!(counters.written.get(), N);
        assert!(counters.written_sizes.borrow().iter().all(|&s| s == size));
        assert_eq!(counters.sink_releases.get(), 1);
        assert_eq!(counters.source_releases.get(), 1);
    }

    #[test]
    fn display_output_uses_configured_size() {
        let (driver, counters) =
            driver(3, Size::new(1280, 720), Size::new(512, 512), None, false);
        driver.run().unwrap();

        assert_eq!(counters.shown.get(), 3);
        assert!(counters
            .written_sizes
            .borrow()
            .iter()
            .all(|&s| s == Size::new(512, 512)));
    }

    #[test]
    fn quit_key_stops_without_error() {
        let (driver, counters) = driver(100, Size::new(64, 64), Size::new(64, 64), Some(2), false);
        let summary = driver.run().unwrap();

        assert_eq!(summary.exit, Exit::Quit);
        assert_eq!(summary.frames, 2);
        assert_eq!(counters.reads.get(), 2);
        assert_eq!(counters.source_releases.get(), 1);
        assert_eq!(counters.sink_releases.get(), 1);
    }

    #[test]
    fn failing_write_still_releases_once() {
        let (driver, counters) = driver(5, Size::new(64, 64), Size::new(64, 64), None, true);
        assert!(matches!(driver.run(), Err(Error::WriterNotOpened(_))));

        assert_eq!(counters.inferences.get(), 1);
        assert_eq!(counters.source_releases.get(), 1);
        assert_eq!(counters.sink_releases.get(), 1);
    }

    #[test]
    fn cleared_running_flag_interrupts_before_reading() {
        let running = Arc::new(AtomicBool::new(true));
        let (driver, counters) = driver(5, Size::new(64, 64), Size::new(64, 64), None, false);
        running.store(false, Ordering::SeqCst);
        let summary = driver.with_running(running).run().unwrap();

        assert_eq!(summary.exit, Exit::Interrupted);
        assert_eq!(counters.reads.get(), 0);
        assert_eq!(counters.sink_releases.get(), 1);
    }

    #[test]
    fn loop_error_wins_over_release_error() {
        let counters = Rc::new(Counters::default());
        let size = Size::new(64, 64);
        let driver = Driver::new(
            FakeSource {
                fail_release: true,
                ..source(5, size, &counters)
            },
            FakeSink {
                quit_after: None,
                fail_write: true,
                counters: counters.clone(),
            },
            model(&counters),
            size,
            InputScale::Raw,
        );
        assert!(matches!(driver.run(), Err(Error::WriterNotOpened(_))));

        assert_eq!(counters.source_releases.get(), 1);
        assert_eq!(counters.sink_releases.get(), 1);
    }

    #[test]
    fn release_error_is_returned_after_a_clean_loop() {
        let counters = Rc::new(Counters::default());
        let size = Size::new(64, 64);
        let driver = Driver::new(
            FakeSource {
                fail_release: true,
                ..source(2, size, &counters)
            },
            FakeSink {
                quit_after: None,
                fail_write: false,
                counters: counters.clone(),
            },
            model(&counters),
            size,
            InputScale::Raw,
        );
        assert!(matches!(driver.run(), Err(Error::CaptureNotOpened(_))));

        assert_eq!(counters.written.get(), 2);
        assert_eq!(counters.sink_releases.get(), 1);
    }

    #[test]
    fn save_mode_into_a_real_video_file() {
        const N: usize = 6;
        const FPS: f64 = 15.0;
        let size = Size::new(96, 64);
        let path = scratch_path("driver");
        let counters = Rc::new(Counters::default());
        let sink = FileSink::from_writer(mjpg_writer(&path, FPS, size), &path).unwrap();

        let summary = Driver::new(
            source(N, size, &counters),
            sink,
            model(&counters),
            size,
            InputScale::Raw,
        )
        .run()
        .unwrap();
        assert_eq!(summary.exit, Exit::CaptureFailed);
        assert_eq!(summary.frames, N);
        assert_eq!(counters.source_releases.get(), 1);

        let (frames, written_size, fps) = written_video_stats(&path);
        assert_eq!(frames, N);
        assert_eq!(written_size, size);
        assert!((fps - FPS).abs() < 1e-3);

        std::fs::remove_file(&path).unwrap();
    }
}
