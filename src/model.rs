use crate::error::Error;
use ndarray::{Array4, ArrayD, ArrayViewD};
use ort::{inputs, session::Session, value::TensorRef};
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

/// An image-to-image translation model.
pub(crate) trait Translator {
    /// Stage a `[1, 3, H, W]` batch for the next inference.
    fn set_input(&mut self, input: Array4<f32>);

    /// Run a forward pass on the staged input.
    fn test(&mut self) -> Result<(), Error>;

    /// The output of the most recent forward pass.
    fn current_output(&self) -> Option<ArrayViewD<'_, f32>>;

    /// Switch layers like batch norm and dropout to inference behavior.
    fn eval(&mut self);
}

/// Location of the generator weights.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Checkpoint {
    /// An explicit model file.
    File(PathBuf),
    /// `<dir>/<name>/<epoch>_net_<net>.onnx`
    Experiment {
        dir: PathBuf,
        name: String,
        epoch: String,
        net: String,
    },
}

impl Checkpoint {
    pub(crate) fn path(&self) -> PathBuf {
        match self {
            Self::File(path) => path.clone(),
            Self::Experiment {
                dir,
                name,
                epoch,
                net,
            } => dir.join(name).join(format!("{}_net_{}.onnx", epoch, net)),
        }
    }

    /// Resolve to a path that exists on disk.
    pub(crate) fn resolve(&self) -> Result<PathBuf, Error> {
        let path = self.path();
        if path.is_file() {
            Ok(path)
        } else {
            Err(Error::ModelNotFound(path))
        }
    }
}

/// A generator network exported to ONNX.
pub(crate) struct OnnxGenerator {
    session: Session,
    input_name: String,
    output_name: String,
    input: Option<Array4<f32>>,
    output: Option<ArrayD<f32>>,
    eval: bool,
}

impl OnnxGenerator {
    #[instrument(name = "OnnxGenerator::new", skip(path), fields(path = %path.as_ref().display()))]
    pub(crate) fn new<P>(path: P, gpu_id: Option<i32>) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let builder =
            Session::builder().map_err(|e| Error::CreateSessionBuilder(e.to_string()))?;

        let builder = match gpu_id {
            None => builder,
            #[cfg(feature = "cuda")]
            Some(device_id) => {
                use ort::execution_providers::CUDAExecutionProvider;
                builder
                    .with_execution_providers([CUDAExecutionProvider::default()
                        .with_device_id(device_id)
                        .build()
                        .error_on_failure()])
                    .map_err(|_| Error::UnsupportedDevice(device_id))?
            }
            #[cfg(not(feature = "cuda"))]
            Some(device_id) => return Err(Error::UnsupportedDevice(device_id)),
        };

        let session = builder
            .commit_from_file(path)
            .map_err(|e| Error::LoadModel(e.to_string(), path.to_path_buf()))?;

        let input_name = session
            .inputs()
            .first()
            .map(|input| input.name().to_string())
            .ok_or(Error::MissingGraphIo("inputs"))?;
        let output_name = session
            .outputs()
            .first()
            .map(|output| output.name().to_string())
            .ok_or(Error::MissingGraphIo("outputs"))?;

        info!(message = "loaded generator", %input_name, %output_name);

        Ok(Self {
            session,
            input_name,
            output_name,
            input: None,
            output: None,
            eval: false,
        })
    }
}

impl Translator for OnnxGenerator {
    fn set_input(&mut self, input: Array4<f32>) {
        self.input = Some(input);
    }

    fn test(&mut self) -> Result<(), Error> {
        let input = self.input.as_ref().ok_or(Error::MissingInput)?;
        let tensor = TensorRef::from_array_view(input.view())
            .map_err(|e| Error::CreateInputTensor(e.to_string()))?;

        let output_name = &self.output_name;
        let outputs = self
            .session
            .run(inputs![self.input_name.as_str() => tensor])
            .map_err(|e| Error::Inference(e.to_string()))?;

        let output = outputs[output_name.as_str()]
            .try_extract_array::<f32>()
            .map_err(|e| Error::ExtractOutput(output_name.clone(), e.to_string()))?
            .to_owned();
        self.output = Some(output);
        Ok(())
    }

    fn current_output(&self) -> Option<ArrayViewD<'_, f32>> {
        self.output.as_ref().map(|output| output.view())
    }

    fn eval(&mut self) {
        if !self.eval {
            self.eval = true;
            warn!(
                message = "ONNX graphs fix their normalization mode at export time; export the generator in eval mode for eval behavior"
            );
        }
    }
}
