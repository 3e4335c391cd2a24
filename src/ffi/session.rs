/**
 * ffi/session.rs
 *
 * FFI bindings for session creation and inspection
 */

use super::*;
use crate::factory::{SessionFactory, SessionOptions};
use crate::params::{ConnectionParameters, Mode, Role, TraversalServerAddr};
use crate::session::{SessionEndpoint, SessionState};
use crate::ui::LogUi;
use libc::c_char;
use std::panic;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

/// What a handle points at: the endpoint plus the runtime its tasks live on
struct FfiSession {
    endpoint: SessionEndpoint,
    runtime: Runtime,
}

fn parameters(config: &NetplaySessionConfig) -> ConnectionParameters {
    let defaults = TraversalServerAddr::default();
    ConnectionParameters {
        role: if config.is_host { Role::Host } else { Role::Client },
        mode: if config.use_traversal { Mode::Traversal } else { Mode::Direct },
        nickname: c_str_to_rust(config.nickname).unwrap_or_default(),
        address: c_str_to_rust(config.address).unwrap_or_default(),
        host_code: c_str_to_rust(config.host_code).unwrap_or_default(),
        port: config.port,
        listen_port: config.listen_port,
        traversal_server_host: c_str_to_rust(config.traversal_server_host).unwrap_or(defaults.host),
        traversal_server_port: if config.traversal_server_port == 0 {
            defaults.port
        } else {
            config.traversal_server_port
        },
        game: c_str_to_rust(config.game).unwrap_or_default().trim().to_string(),
    }
}

fn session_ref<'a>(handle: *const NetplaySessionHandle) -> Option<&'a FfiSession> {
    if handle.is_null() {
        set_last_error(1, "Null session handle");
        return None;
    }
    Some(unsafe { &*(handle as *const FfiSession) })
}

/// Create a session and block until it is connected or has failed.
/// Returns null on failure; see `netplay_last_error`.
#[no_mangle]
pub extern "C" fn netplay_session_create(
    config: *const NetplaySessionConfig,
) -> *mut NetplaySessionHandle {
    if config.is_null() {
        set_last_error(1, "Null session config");
        return std::ptr::null_mut();
    }
    let config = unsafe { &*config };
    let params = parameters(config);

    let mut options = SessionOptions::default();
    if config.connect_timeout_ms != 0 {
        options.connect_timeout = Duration::from_millis(u64::from(config.connect_timeout_ms));
    }
    options.upnp = config.upnp;

    let runtime = match Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            set_last_error(-1, &format!("Failed to start runtime: {}", e));
            return std::ptr::null_mut();
        }
    };

    let factory = SessionFactory::with_options(Arc::new(LogUi), options);
    let created = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        runtime.block_on(factory.create(&params))
    }));

    match created {
        Ok(Ok(endpoint)) => {
            let session = Box::new(FfiSession { endpoint, runtime });
            Box::into_raw(session) as *mut NetplaySessionHandle
        }
        Ok(Err(e)) => {
            set_last_error(e.code(), &e.to_string());
            std::ptr::null_mut()
        }
        Err(_) => {
            set_last_error(-1, "Session creation panicked");
            std::ptr::null_mut()
        }
    }
}

/// Get current session state
#[no_mangle]
pub extern "C" fn netplay_session_state(handle: *const NetplaySessionHandle) -> NetplayState {
    match session_ref(handle) {
        Some(session) => session.endpoint.state().into(),
        None => NetplayState::Failed,
    }
}

/// Bound local port, 0 for a null handle
#[no_mangle]
pub extern "C" fn netplay_session_port(handle: *const NetplaySessionHandle) -> u16 {
    session_ref(handle)
        .map(|session| session.endpoint.local_port())
        .unwrap_or(0)
}

/// Host code of a traversal host, null otherwise.
/// Release with `netplay_free_string`.
#[no_mangle]
pub extern "C" fn netplay_session_host_code(handle: *const NetplaySessionHandle) -> *mut c_char {
    match session_ref(handle).and_then(|session| session.endpoint.host_code()) {
        Some(code) => to_c_string(code.as_str()),
        None => std::ptr::null_mut(),
    }
}

/// Number of other players in the session
#[no_mangle]
pub extern "C" fn netplay_session_peer_count(handle: *const NetplaySessionHandle) -> u32 {
    session_ref(handle)
        .map(|session| session.endpoint.peers().len() as u32)
        .unwrap_or(0)
}

/// Change the game (hosts only)
/// Returns 0 on success, -1 on error
#[no_mangle]
pub extern "C" fn netplay_session_change_game(
    handle: *const NetplaySessionHandle,
    game: *const c_char,
) -> i32 {
    let Some(session) = session_ref(handle) else {
        return -1;
    };
    let Some(game) = c_str_to_rust(game) else {
        set_last_error(1, "Invalid game name");
        return -1;
    };

    match session.endpoint.change_game(&game) {
        Ok(()) => 0,
        Err(e) => {
            set_last_error(e.code(), &e.to_string());
            -1
        }
    }
}

/// Close and free a session
#[no_mangle]
pub extern "C" fn netplay_session_free(handle: *mut NetplaySessionHandle) {
    if !handle.is_null() {
        let session = unsafe { Box::from_raw(handle as *mut FfiSession) };
        let FfiSession { endpoint, runtime } = *session;
        runtime.block_on(endpoint.close());
    }
}

/// Get state name as string
#[no_mangle]
pub extern "C" fn netplay_state_to_string(state: NetplayState) -> *mut c_char {
    to_c_string(SessionState::from(state).as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    fn config(nickname: &CString) -> NetplaySessionConfig {
        NetplaySessionConfig {
            is_host: true,
            use_traversal: false,
            nickname: nickname.as_ptr(),
            address: std::ptr::null(),
            host_code: std::ptr::null(),
            port: 0,
            listen_port: 0,
            traversal_server_host: std::ptr::null(),
            traversal_server_port: 0,
            connect_timeout_ms: 0,
            game: std::ptr::null(),
            upnp: false,
        }
    }

    #[test]
    fn direct_host_through_the_abi() {
        let nickname = CString::new("Host").unwrap();
        let handle = netplay_session_create(&config(&nickname));
        assert!(!handle.is_null());

        assert_eq!(netplay_session_state(handle), NetplayState::Connected);
        assert_ne!(netplay_session_port(handle), 0);
        assert!(netplay_session_host_code(handle).is_null());
        assert_eq!(netplay_session_peer_count(handle), 0);

        let game = CString::new("Super Smash Bros. Melee").unwrap();
        assert_eq!(netplay_session_change_game(handle, game.as_ptr()), 0);

        netplay_session_free(handle);
    }

    #[test]
    fn failures_set_the_last_error() {
        let nickname = CString::new("   ").unwrap();
        let handle = netplay_session_create(&config(&nickname));
        assert!(handle.is_null());
        assert_eq!(netplay_last_error_code(), 1);

        let message = netplay_last_error();
        assert!(c_str_to_rust(message).unwrap().contains("nickname"));
        netplay_free_string(message);
    }

    #[test]
    fn state_names() {
        let name = netplay_state_to_string(NetplayState::Resolving);
        assert_eq!(c_str_to_rust(name).as_deref(), Some("Resolving host code"));
        netplay_free_string(name);
    }
}
