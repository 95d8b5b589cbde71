use crate::error::Error;
use opencv::{
    core::{Mat, Size},
    highgui::{destroy_all_windows, imshow, named_window, wait_key, WINDOW_AUTOSIZE},
    prelude::*,
    videoio::VideoWriter,
};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

pub(crate) const INPUT_WINDOW: &str = "cam-input";
pub(crate) const OUTPUT_WINDOW: &str = "cam-output";

const ESC_KEY: i32 = 27;
const Q_KEY: u8 = b'q';

/// Fourcc of the written stream. There is no codec negotiation.
pub(crate) const FOURCC: [char; 4] = ['H', '2', '6', '4'];

/// Whether a `wait_key` result asks the loop to stop.
pub(crate) fn is_quit_key(key: i32) -> bool {
    key == ESC_KEY || key == i32::from(Q_KEY)
}

/// `<source dir>/<source stem>_style.mov`
pub(crate) fn styled_output_path(source: &Path) -> Result<PathBuf, Error> {
    let stem = source
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.split('.').next())
        .filter(|stem| !stem.is_empty())
        .ok_or_else(|| Error::DeriveOutputPath(source.to_path_buf()))?;
    let dir = source.parent().unwrap_or_else(|| Path::new(""));
    Ok(dir.join(format!("{}_style.mov", stem)))
}

/// Where translated frames go.
pub(crate) trait FrameSink {
    /// Present the raw captured frame, for sinks that show it.
    fn show_input(&mut self, frame: &Mat) -> Result<(), Error>;

    fn write_output(&mut self, frame: &Mat) -> Result<(), Error>;

    /// Whether the user asked to stop.
    fn poll_quit(&mut self) -> Result<bool, Error>;

    /// Release the sink. Calling this more than once is a no-op.
    fn release(&mut self) -> Result<(), Error>;
}

/// Interactive input and output windows.
pub(crate) struct WindowSink {
    wait_key_ms: i32,
    released: bool,
}

impl WindowSink {
    #[instrument(name = "WindowSink::new")]
    pub(crate) fn new(wait_key_ms: i32) -> Result<Self, Error> {
        for name in &[INPUT_WINDOW, OUTPUT_WINDOW] {
            named_window(name, WINDOW_AUTOSIZE)
                .map_err(|e| Error::NamedWindow(e, name.to_string()))?;
        }
        Ok(Self {
            wait_key_ms,
            released: false,
        })
    }
}

impl FrameSink for WindowSink {
    fn show_input(&mut self, frame: &Mat) -> Result<(), Error> {
        imshow(INPUT_WINDOW, frame).map_err(Error::ImShow)
    }

    fn write_output(&mut self, frame: &Mat) -> Result<(), Error> {
        imshow(OUTPUT_WINDOW, frame).map_err(Error::ImShow)
    }

    fn poll_quit(&mut self) -> Result<bool, Error> {
        Ok(is_quit_key(wait_key(self.wait_key_ms).map_err(Error::WaitKey)?))
    }

    fn release(&mut self) -> Result<(), Error> {
        if !self.released {
            self.released = true;
            debug!(message = "destroying windows");
            destroy_all_windows().map_err(Error::DestroyWindows)?;
        }
        Ok(())
    }
}

impl Drop for WindowSink {
    fn drop(&mut self) {
        if let Err(error) = self.release() {
            tracing::error!(message = "failed to destroy windows on drop", %error);
        }
    }
}

/// A video file receiving every translated frame.
pub(crate) struct FileSink {
    writer: VideoWriter,
    path: PathBuf,
    frames: usize,
    released: bool,
}

impl FileSink {
    /// Open a writer with the fixed [`FOURCC`].
    #[instrument(name = "FileSink::create")]
    pub(crate) fn create(path: &Path, fps: f64, frame_size: Size) -> Result<Self, Error> {
        let [c1, c2, c3, c4] = FOURCC;
        let fourcc = VideoWriter::fourcc(c1, c2, c3, c4).map_err(Error::FourCc)?;
        let filename = path
            .to_str()
            .ok_or_else(|| Error::PathToStr(path.to_path_buf()))?;
        let writer = VideoWriter::new(filename, fourcc, fps, frame_size, true)
            .map_err(|e| Error::OpenWriter(e, path.to_path_buf()))?;
        Self::from_writer(writer, path)
    }

    /// Wrap an already constructed writer.
    pub(crate) fn from_writer(writer: VideoWriter, path: &Path) -> Result<Self, Error> {
        if !writer
            .is_opened()
            .map_err(|e| Error::OpenWriter(e, path.to_path_buf()))?
        {
            return Err(Error::WriterNotOpened(path.to_path_buf()));
        }
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            frames: 0,
            released: false,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl FrameSink for FileSink {
    fn show_input(&mut self, _frame: &Mat) -> Result<(), Error> {
        Ok(())
    }

    fn write_output(&mut self, frame: &Mat) -> Result<(), Error> {
        self.writer.write(frame).map_err(Error::WriteFrame)?;
        self.frames += 1;
        Ok(())
    }

    fn poll_quit(&mut self) -> Result<bool, Error> {
        Ok(false)
    }

    fn release(&mut self) -> Result<(), Error> {
        if !self.released {
            self.released = true;
            debug!(message = "closing video writer", path = %self.path.display(), frames = self.frames);
            self.writer.release().map_err(Error::ReleaseWriter)?;
        }
        Ok(())
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if let Err(error) = self.release() {
            tracing::error!(message = "failed to close video writer on drop", %error);
        }
    }
}
