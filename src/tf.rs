//! Frozen-graph TensorFlow backend.

use ndarray::{ArrayD, IxDyn};
use tensorflow::{Graph, ImportGraphDefOptions, Session, SessionOptions, SessionRunArgs, Tensor};
use tracing::debug;

use std::fs;

use crate::config::ModelConfig;
use crate::error::LprError;
use crate::inference::{InferenceBackend, Model};

#[derive(Debug, Default, Clone, Copy)]
pub struct TensorFlowBackend;

impl InferenceBackend for TensorFlowBackend {
    fn load(&self, model: &ModelConfig) -> Result<Box<dyn Model>, LprError> {
        Ok(Box::new(GraphModel::new(model)?))
    }
}

pub struct GraphModel {
    graph: Graph,
    session: Session,
    input_name: String,
    output_names: Vec<String>,
}

impl GraphModel {
    pub fn new(config: &ModelConfig) -> Result<Self, LprError> {
        let pb = fs::read(&config.path)?;
        // import graph def
        let mut graph = Graph::new();
        let graph_def_options = ImportGraphDefOptions::new();
        graph.import_graph_def(&pb, &graph_def_options)?;
        // new session
        let session_option = SessionOptions::new();
        let session = Session::new(&session_option, &graph)?;
        debug!(path = %config.path.display(), input = %config.input, "loaded frozen graph");
        Ok(Self {
            graph,
            session,
            input_name: config.input.clone(),
            output_names: config.outputs.clone(),
        })
    }
}

impl Model for GraphModel {
    fn run(&self, input: &ArrayD<f32>) -> Result<Vec<ArrayD<f32>>, LprError> {
        let dims: Vec<u64> = input.shape().iter().map(|d| *d as u64).collect();
        let values: Vec<f32> = input.iter().copied().collect();
        let tensor = Tensor::<f32>::new(&dims).with_values(&values)?;

        let mut args = SessionRunArgs::new();
        args.add_feed(&self.graph.operation_by_name_required(&self.input_name)?, 0, &tensor);
        let mut tokens = Vec::with_capacity(self.output_names.len());
        for name in &self.output_names {
            tokens.push(args.request_fetch(&self.graph.operation_by_name_required(name)?, 0));
        }
        self.session.run(&mut args).map_err(LprError::inference)?;

        let mut outputs = Vec::with_capacity(tokens.len());
        for token in tokens {
            let res: Tensor<f32> = args.fetch(token).map_err(LprError::inference)?;
            let shape: Vec<usize> = res.dims().iter().map(|d| *d as usize).collect();
            outputs.push(ArrayD::from_shape_vec(IxDyn(&shape), res.to_vec())?);
        }
        Ok(outputs)
    }
}
