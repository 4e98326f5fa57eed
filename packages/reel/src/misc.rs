use std::any::Any;

/// Try to get info from a panic payload
pub fn best_effort_panic_info<'a>(payload: &'a Box<dyn Any + Send + 'static>) -> &'a str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        crate::debug!(
            "encountered unknown panic info with type id: {:?}",
            (**payload).type_id()
        );
        "unknown panic info"
    }
}

/// Run `f`, turning a panic into an error that carries the panic message
pub(crate) fn catch_panic<T>(what: &str, f: impl FnOnce() -> T) -> crate::Result<T> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(x) => Ok(x),
        Err(payload) => {
            let info = best_effort_panic_info(&payload);
            crate::error!("{what} panicked: {info}");
            crate::bail!("{what} panicked: {info}")
        }
    }
}
