//! Tasks every taskline deployment ships with.

use taskline_core::{
    HandlerResult, Result, TaskArgs, TaskContext, TaskOptions, TaskRegistry, TaskValue,
};

/// `echo(word) -> "Echo: " + word`, the round-trip health check
pub async fn echo(_ctx: TaskContext, args: TaskArgs) -> HandlerResult {
    let word = args.str(0, "word")?;
    Ok(TaskValue::from(format!("Echo: {}", word)))
}

/// Register the built-in tasks under `echo` and `echo_msg`
pub fn register_builtin_tasks(registry: &mut TaskRegistry) -> Result<()> {
    registry.register_fn("echo", TaskOptions::default(), echo)?;
    registry.register_fn("echo_msg", TaskOptions::default(), echo)?;
    Ok(())
}
