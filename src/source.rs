use crate::error::Error;
use num_traits::cast::ToPrimitive;
use opencv::{
    core::{Mat, Size},
    prelude::*,
    videoio::{
        VideoCapture, CAP_ANY, CAP_PROP_FPS, CAP_PROP_FRAME_COUNT, CAP_PROP_FRAME_HEIGHT,
        CAP_PROP_FRAME_WIDTH,
    },
};
use std::{
    fmt,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};

/// Where frames come from: a video file or a camera device index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum VideoSource {
    File(PathBuf),
    Device(i32),
}

impl VideoSource {
    /// Resolve a command line argument into a video source.
    ///
    /// An argument naming an existing file wins over an integer parse, so a
    /// file literally called `0` is still read as a file.
    pub(crate) fn resolve(arg: &str) -> Result<Self, Error> {
        let path = Path::new(arg);
        if path.is_file() {
            let path = path
                .canonicalize()
                .map_err(|e| Error::CanonicalizePath(e, path.to_path_buf()))?;
            Ok(Self::File(path))
        } else {
            arg.trim()
                .parse()
                .map(Self::Device)
                .map_err(|e| Error::ParseVideoSource(arg.to_owned(), e))
        }
    }

    pub(crate) fn as_file(&self) -> Option<&Path> {
        match self {
            Self::File(path) => Some(path),
            Self::Device(_) => None,
        }
    }
}

impl fmt::Display for VideoSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Device(index) => write!(f, "device {}", index),
        }
    }
}

/// A blocking source of BGR frames.
pub(crate) trait FrameSource {
    /// Read the next frame into `frame`, returning false when no frame is available.
    fn read(&mut self, frame: &mut Mat) -> Result<bool, Error>;

    fn frame_size(&self) -> Result<Size, Error>;

    fn fps(&self) -> Result<f64, Error>;

    /// Total number of frames, when the source knows it.
    fn frame_count(&self) -> Result<Option<u64>, Error>;

    /// Release the underlying device. Calling this more than once is a no-op.
    fn release(&mut self) -> Result<(), Error>;
}

/// A [`FrameSource`] backed by an OpenCV `VideoCapture`.
pub(crate) struct Capture {
    capture: VideoCapture,
    released: bool,
}

impl Capture {
    #[instrument(name = "Capture::open")]
    pub(crate) fn open(source: &VideoSource) -> Result<Self, Error> {
        let capture = match source {
            VideoSource::File(path) => VideoCapture::from_file(
                path.to_str()
                    .ok_or_else(|| Error::PathToStr(path.clone()))?,
                CAP_ANY,
            ),
            VideoSource::Device(index) => VideoCapture::new(*index, CAP_ANY),
        }
        .map_err(Error::OpenCapture)?;

        if !capture.is_opened().map_err(Error::OpenCapture)? {
            return Err(Error::CaptureNotOpened(source.to_string()));
        }

        Ok(Self {
            capture,
            released: false,
        })
    }

    fn property(&self, prop: i32) -> Result<f64, Error> {
        self.capture
            .get(prop)
            .map_err(|e| Error::GetCaptureProperty(prop, e))
    }
}

impl FrameSource for Capture {
    fn read(&mut self, frame: &mut Mat) -> Result<bool, Error> {
        if self.released {
            return Ok(false);
        }
        // some backends report success and hand back an empty frame at end of stream
        Ok(self.capture.read(frame).map_err(Error::ReadFrame)? && !frame.empty())
    }

    fn frame_size(&self) -> Result<Size, Error> {
        let width = self.property(CAP_PROP_FRAME_WIDTH)?;
        let height = self.property(CAP_PROP_FRAME_HEIGHT)?;
        Ok(Size::new(
            width.to_i32().ok_or(Error::ConvertToI32)?,
            height.to_i32().ok_or(Error::ConvertToI32)?,
        ))
    }

    fn fps(&self) -> Result<f64, Error> {
        self.property(CAP_PROP_FPS)
    }

    fn frame_count(&self) -> Result<Option<u64>, Error> {
        let count = self.property(CAP_PROP_FRAME_COUNT)?;
        Ok(if count > 0.0 { count.to_u64() } else { None })
    }

    fn release(&mut self) -> Result<(), Error> {
        if !self.released {
            self.released = true;
            debug!(message = "releasing video capture");
            self.capture.release().map_err(Error::ReleaseCapture)?;
        }
        Ok(())
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        if let Err(error) = self.release() {
            tracing::error!(message = "failed to release video capture on drop", %error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Capture, FrameSource, VideoSource};
    use crate::{
        convert::tests::solid_frame,
        error::Error,
        sink::tests::{mjpg_writer, scratch_path},
    };
    use opencv::{
        core::{Mat, Size},
        prelude::*,
    };

    #[test]
    fn integer_argument_is_a_device() {
        assert_eq!(VideoSource::resolve("0").unwrap(), VideoSource::Device(0));
        assert_eq!(VideoSource::resolve(" 2 ").unwrap(), VideoSource::Device(2));
    }

    #[test]
    fn existing_file_is_a_file() {
        let path = std::env::temp_dir().join(format!("style-cam-source-{}.mp4", std::process::id()));
        std::fs::write(&path, b"not really a video").unwrap();

        let source = VideoSource::resolve(path.to_str().unwrap()).unwrap();
        let expected = path.canonicalize().unwrap();
        assert_eq!(source, VideoSource::File(expected.clone()));
        assert_eq!(source.as_file(), Some(expected.as_path()));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_file_that_is_not_a_number_is_an_error() {
        assert!(matches!(
            VideoSource::resolve("/definitely/not/here.mp4"),
            Err(Error::ParseVideoSource(..))
        ));
    }

    #[test]
    fn device_has_no_file() {
        assert_eq!(VideoSource::Device(1).as_file(), None);
        assert_eq!(VideoSource::Device(1).to_string(), "device 1");
    }

    #[test]
    fn capture_reads_every_frame_then_stops() {
        const N: usize = 5;
        const FPS: f64 = 10.0;
        let size = Size::new(80, 60);
        let path = scratch_path("capture");

        let mut writer = mjpg_writer(&path, FPS, size);
        for _ in 0..N {
            writer
                .write(&solid_frame(size.width, size.height, (40, 80, 120)))
                .unwrap();
        }
        writer.release().unwrap();
        drop(writer);

        let mut capture = Capture::open(&VideoSource::File(path.clone())).unwrap();
        assert_eq!(capture.frame_size().unwrap(), size);
        assert!((capture.fps().unwrap() - FPS).abs() < 1e-3);
        assert_eq!(capture.frame_count().unwrap(), Some(N as u64));

        let mut frame = Mat::default();
        let mut reads = 0;
        while capture.read(&mut frame).unwrap() {
            assert_eq!(frame.size().unwrap(), size);
            reads += 1;
        }
        assert_eq!(reads, N);

        capture.release().unwrap();
        capture.release().unwrap();
        assert!(!capture.read(&mut frame).unwrap());
        drop(capture);

        std::fs::remove_file(&path).unwrap();
    }
}
