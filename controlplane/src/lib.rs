#![allow(unsafe_op_in_unsafe_fn)]

pub mod agent;
pub mod error;
pub mod info;
pub mod publish;

pub use agent::{Agent, DeviceConfig, ModuleFreeFn, PipelineConfig};
pub use error::{CpError, CpResult};
pub use info::{
    AgentInfo, DeviceInfo, ModuleInfo, PipelineInfo, agents_info, counter_values, devices_info,
    modules_info, pipelines_info,
};
pub use publish::PublishOptions;
