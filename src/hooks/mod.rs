mod registry;
mod run;

pub use registry::{
    HookEntry, HookEvent, HookRegistry, PROTECTED_HOOKS, effective_timeout, is_disabled,
    is_protected,
};
pub use run::{HEARTBEAT_HOOK, HookResult, heartbeat_extras, run_heartbeat};
