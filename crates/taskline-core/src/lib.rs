pub mod codec;
pub mod error;
pub mod message;
pub mod record;
pub mod registry;
pub mod settings;
pub mod task;
pub mod value;

pub use codec::InvocationCodec;
pub use error::{Result, TaskError};
pub use message::{Delivery, DeliveryTag, Envelope, Requeue};
pub use record::{ErrorKind, ExecutionRecord, TaskFailure, TaskState};
pub use registry::{
    HandlerError, HandlerResult, TaskContext, TaskDefinition, TaskHandler, TaskOptions,
    TaskRegistry,
};
pub use settings::{Settings, TaskAnnotation, TaskPolicy};
pub use task::{InvocationBuilder, Kwargs, TaskArgs, TaskId, TaskInvocation};
pub use value::TaskValue;

/// Upper bound on an encoded invocation or result
pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;
