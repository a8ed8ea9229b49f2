use lua_dap_config::LoggingConfig;

/// Initialize structured logging and install a global panic hook for the
/// adapter process.
///
/// Request handlers still isolate panics with `catch_unwind`; the hook is the
/// last-resort record for panics anywhere else, such as the reader threads.
pub fn init(logging: &LoggingConfig) {
    lua_dap_config::init_tracing(logging);

    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|location| format!("{}:{}", location.file(), location.line()))
            .unwrap_or_else(|| "<unknown>".to_owned());
        let message = info
            .payload()
            .downcast_ref::<&str>()
            .map(|message| (*message).to_owned())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<non-string panic payload>".to_owned());
        tracing::error!(target: "lua_dap.panic", %location, %message, "panic");
        previous(info);
    }));
}
