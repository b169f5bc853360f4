//! Capability names. The registry is the single source of truth for
//! dotted capability identifiers; routes declare a required subset and
//! the guard checks principal coverage against it. Append-only.

pub const CAP_AUTH_REGISTER: &str = "core.auth.register";
pub const CAP_AUTH_LOGIN: &str = "core.auth.login";
pub const CAP_USERS_READ: &str = "users.read";
pub const CAP_DEVICES_HELLO: &str = "devices.hello";
pub const CAP_DEVICES_READ: &str = "devices.read";
pub const CAP_DEVICES_WRITE: &str = "devices.write";
pub const CAP_PAIRING_START: &str = "pairing.start";
pub const CAP_PAIRING_CONFIRM: &str = "pairing.confirm";
pub const CAP_TELEMETRY_EMIT: &str = "telemetry.emit";
pub const CAP_TELEMETRY_READ: &str = "telemetry.read";
pub const CAP_TASKS_READ: &str = "tasks.read";
pub const CAP_TASKS_WRITE: &str = "tasks.write";
pub const CAP_VARS_READ: &str = "vars.read";
pub const CAP_VARS_WRITE: &str = "vars.write";
pub const CAP_VARS_ACK: &str = "vars.ack";
pub const CAP_EFFECTS_READ: &str = "effects.read";

/// Central capability registry.
pub const REGISTRY: &[&str] = &[
    CAP_AUTH_REGISTER,
    CAP_AUTH_LOGIN,
    CAP_USERS_READ,
    CAP_DEVICES_HELLO,
    CAP_DEVICES_READ,
    CAP_DEVICES_WRITE,
    CAP_PAIRING_START,
    CAP_PAIRING_CONFIRM,
    CAP_TELEMETRY_EMIT,
    CAP_TELEMETRY_READ,
    CAP_TASKS_READ,
    CAP_TASKS_WRITE,
    CAP_VARS_READ,
    CAP_VARS_WRITE,
    CAP_VARS_ACK,
    CAP_EFFECTS_READ,
];

/// Capabilities a device principal implicitly holds. Covers the device
/// surface: variable reads/acks, telemetry emission, and the task loop.
pub const DEVICE_CAPS: &[&str] = &[
    CAP_VARS_READ,
    CAP_VARS_ACK,
    CAP_TELEMETRY_EMIT,
    CAP_TASKS_READ,
    CAP_TASKS_WRITE,
    CAP_DEVICES_READ,
];

/// Capabilities embedded in access tokens issued at login/registration.
pub const USER_CAPS: &[&str] = &[
    CAP_AUTH_REGISTER,
    CAP_AUTH_LOGIN,
    CAP_USERS_READ,
    CAP_DEVICES_HELLO,
    CAP_DEVICES_READ,
    CAP_DEVICES_WRITE,
    CAP_PAIRING_START,
    CAP_PAIRING_CONFIRM,
    CAP_TELEMETRY_EMIT,
    CAP_TELEMETRY_READ,
    CAP_TASKS_READ,
    CAP_TASKS_WRITE,
    CAP_VARS_READ,
    CAP_VARS_WRITE,
    CAP_VARS_ACK,
    CAP_EFFECTS_READ,
];

/// Names from `caps` that are not in the registry.
pub fn unknown_caps<'a>(caps: &'a [String]) -> Vec<&'a str> {
    caps.iter()
        .map(String::as_str)
        .filter(|cap| !REGISTRY.contains(cap))
        .collect()
}

/// True when every required capability appears in `held`.
pub fn covers<H: AsRef<str>>(required: &[&str], held: &[H]) -> bool {
    required
        .iter()
        .all(|req| held.iter().any(|h| h.as_ref() == *req))
}
