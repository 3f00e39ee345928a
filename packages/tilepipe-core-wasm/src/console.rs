// Browser console on wasm, tracing everywhere else.
//
// Imported JS functions cannot be called on native targets, so the native
// build routes through `tracing` and leaves subscriber setup to the host.

#[cfg(target_arch = "wasm32")]
pub fn log(s: &str) {
    web_sys::console::log_1(&s.into());
}

#[cfg(target_arch = "wasm32")]
pub fn warn(s: &str) {
    web_sys::console::warn_1(&s.into());
}

#[cfg(not(target_arch = "wasm32"))]
pub fn log(s: &str) {
    tracing::debug!(target: "tilepipe", "{}", s);
}

#[cfg(not(target_arch = "wasm32"))]
pub fn warn(s: &str) {
    tracing::warn!(target: "tilepipe", "{}", s);
}

// Note: the console_log / console_warn macros are defined in lib.rs
