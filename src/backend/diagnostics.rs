// Validation diagnostics
//
// The debug-utils messenger hands every message to a Diagnostics sink. What
// happens on an error-severity message is a policy choice: abort right away
// (the development default) or latch the message so the next begin_frame
// fails with BackendError::Validation.

use ash::vk;
use parking_lot::Mutex;
use serde::Deserialize;
use std::ffi::CStr;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::BackendError;

/// What to do with an error-severity validation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationPolicy {
    /// Log it and terminate the process
    Abort,
    /// Log it and fail the next frame
    Report,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            ValidationPolicy::Abort
        } else {
            ValidationPolicy::Report
        }
    }
}

/// Message severity as seen by the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Verbose,
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn from_vk(flags: vk::DebugUtilsMessageSeverityFlagsEXT) -> Self {
        if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
            Severity::Error
        } else if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
            Severity::Warning
        } else if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
            Severity::Info
        } else {
            Severity::Verbose
        }
    }

    fn log_level(self) -> log::Level {
        match self {
            Severity::Error => log::Level::Error,
            Severity::Warning => log::Level::Warn,
            Severity::Info | Severity::Verbose => log::Level::Debug,
        }
    }
}

type Terminator = Box<dyn Fn() + Send + Sync>;

pub struct Diagnostics {
    policy: ValidationPolicy,
    first_error: Mutex<Option<String>>,
    terminated: AtomicBool,
    terminate: Terminator,
}

impl Diagnostics {
    pub fn new(policy: ValidationPolicy) -> Self {
        Self::with_terminator(policy, Box::new(|| std::process::abort()))
    }

    /// Same as `new`, with a custom termination hook for the Abort policy
    pub fn with_terminator(policy: ValidationPolicy, terminate: Terminator) -> Self {
        Self {
            policy,
            first_error: Mutex::new(None),
            terminated: AtomicBool::new(false),
            terminate,
        }
    }

    /// Log a message and apply the policy to errors
    pub fn report(&self, severity: Severity, message: &str) {
        log::log!(severity.log_level(), "[Vulkan] {}", message);

        if severity != Severity::Error {
            return;
        }

        {
            let mut first = self.first_error.lock();
            if first.is_none() {
                *first = Some(message.to_owned());
            }
        }

        if self.policy == ValidationPolicy::Abort && !self.terminated.swap(true, Ordering::SeqCst) {
            log::error!("Terminating on validation error");
            (self.terminate)();
        }
    }

    /// Fails once an error-severity message has been reported
    pub fn check(&self) -> Result<(), BackendError> {
        match self.first_error.lock().as_ref() {
            Some(message) => Err(BackendError::Validation(message.clone())),
            None => Ok(()),
        }
    }
}

/// Messenger callback; user data points at the context's Diagnostics
pub(crate) unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();
    let severity = Severity::from_vk(message_severity);

    match (p_user_data as *const Diagnostics).as_ref() {
        Some(diagnostics) => diagnostics.report(severity, &message),
        None => log::log!(severity.log_level(), "[Vulkan] {}", message),
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn counting(policy: ValidationPolicy) -> (Diagnostics, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let hook = count.clone();
        let diagnostics = Diagnostics::with_terminator(
            policy,
            Box::new(move || {
                hook.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (diagnostics, count)
    }

    #[test]
    fn test_severity_mapping() {
        use vk::DebugUtilsMessageSeverityFlagsEXT as F;
        assert_eq!(Severity::from_vk(F::ERROR), Severity::Error);
        assert_eq!(Severity::from_vk(F::WARNING), Severity::Warning);
        assert_eq!(Severity::from_vk(F::INFO), Severity::Info);
        assert_eq!(Severity::from_vk(F::VERBOSE), Severity::Verbose);
        assert_eq!(Severity::Info.log_level(), log::Level::Debug);
        assert_eq!(Severity::Warning.log_level(), log::Level::Warn);
        assert_eq!(Severity::Error.log_level(), log::Level::Error);
    }

    #[test]
    fn test_warnings_are_not_errors() {
        let (diagnostics, count) = counting(ValidationPolicy::Abort);
        diagnostics.report(Severity::Warning, "slow path");
        diagnostics.report(Severity::Info, "hello");
        assert!(diagnostics.check().is_ok());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_abort_policy_terminates_exactly_once() {
        let (diagnostics, count) = counting(ValidationPolicy::Abort);
        diagnostics.report(Severity::Error, "first");
        diagnostics.report(Severity::Error, "second");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_report_policy_latches_first_error() {
        let (diagnostics, count) = counting(ValidationPolicy::Report);
        diagnostics.report(Severity::Error, "bad barrier");
        diagnostics.report(Severity::Error, "bad layout");

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(
            diagnostics.check(),
            Err(BackendError::Validation("bad barrier".to_string()))
        );
        // Stays failed
        assert!(diagnostics.check().is_err());
    }

    #[test]
    fn test_policy_parses_from_config_strings() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: ValidationPolicy,
        }
        let w: Wrapper = toml::from_str("policy = \"report\"").unwrap();
        assert_eq!(w.policy, ValidationPolicy::Report);
        let w: Wrapper = toml::from_str("policy = \"abort\"").unwrap();
        assert_eq!(w.policy, ValidationPolicy::Abort);
    }
}
