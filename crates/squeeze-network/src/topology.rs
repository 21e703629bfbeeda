use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::shape::FeatureShape;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageKind {
    Input,
    Convolution {
        kernel: usize,
        stride: usize,
        padding: usize,
    },
    MaxPool {
        kernel: usize,
        stride: usize,
    },
    Concat,
    Dropout {
        probability: f64,
    },
    GlobalAveragePool,
    Softmax,
}

impl Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => "input".fmt(f),
            Self::Convolution {
                kernel,
                stride,
                padding,
            } => write!(f, "conv {kernel}x{kernel} /{stride} pad {padding}"),
            Self::MaxPool { kernel, stride } => write!(f, "max-pool {kernel}x{kernel} /{stride}"),
            Self::Concat => "concat".fmt(f),
            Self::Dropout { probability } => write!(f, "dropout p={probability}"),
            Self::GlobalAveragePool => "global avg-pool".fmt(f),
            Self::Softmax => "softmax".fmt(f),
        }
    }
}

/// A single named layer of the network, and the shape it produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub kind: StageKind,
    pub output: FeatureShape,
}

/// The layers of a network in evaluation order, as traced from its configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    stages: Vec<Stage>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a stage, returning its output so tracing code can chain on it.
    pub fn push(
        &mut self,
        name: impl Into<String>,
        kind: StageKind,
        output: FeatureShape,
    ) -> FeatureShape {
        self.stages.push(Stage {
            name: name.into(),
            kind,
            output,
        });

        output
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    pub fn output(&self) -> Option<FeatureShape> {
        self.stages.last().map(|stage| stage.output)
    }
}

impl Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name_width = self
            .stages
            .iter()
            .map(|stage| stage.name.len())
            .max()
            .unwrap_or_default();

        for stage in &self.stages {
            writeln!(
                f,
                "{:<name_width$}  {:<24}  {}",
                stage.name,
                stage.kind.to_string(),
                stage.output
            )?;
        }

        Ok(())
    }
}
