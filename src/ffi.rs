use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::sync::Arc;

use tracing::warn;

use crate::error::SyncError;
use crate::model::{Collection, OpType};
use crate::oplog::{OperationLog, PendingOperation};
use crate::storage::SqliteStore;

/// Opaque handle that owns an operation log over a SQLite file.
/// Native shells hold this as an unsafe pointer and pass it back to Rust APIs.
pub struct FleetSyncHandle {
    log: OperationLog,
}

fn ptr_to_str<'a>(ptr: *const c_char) -> Result<&'a str, ()> {
    if ptr.is_null() {
        return Err(());
    }
    unsafe { CStr::from_ptr(ptr).to_str().map_err(|_| ()) }
}

fn to_cstring_ptr(s: &str) -> *mut c_char {
    CString::new(s).map(|cs| cs.into_raw()).unwrap_or(std::ptr::null_mut())
}

fn open_log(path: &str) -> Result<OperationLog, SyncError> {
    let store = if path == ":memory:" {
        SqliteStore::open_in_memory()?
    } else {
        SqliteStore::open(path)?
    };
    OperationLog::open(Arc::new(store))
}

fn enqueue_json(
    log: &OperationLog,
    kind: &str,
    collection: &str,
    payload: &str,
) -> Result<String, SyncError> {
    let kind: OpType = kind.parse()?;
    let collection: Collection = collection.parse()?;
    let payload: serde_json::Value = serde_json::from_str(payload)?;
    let queued = log.enqueue(PendingOperation::new(kind, collection, payload))?;
    Ok(serde_json::to_string(&queued)?)
}

/// Free a C string returned by this library.
#[unsafe(no_mangle)]
pub extern "C" fn fleet_sync_string_free(s: *mut c_char) {
    if s.is_null() {
        return;
    }
    unsafe { let _ = CString::from_raw(s); }
}

/// Open the operation log stored at `path` (or ":memory:").
/// Returns null on failure.
#[unsafe(no_mangle)]
pub extern "C" fn fleet_sync_open(path: *const c_char) -> *mut FleetSyncHandle {
    let path = match ptr_to_str(path) {
        Ok(s) => s,
        Err(_) => return std::ptr::null_mut(),
    };
    match open_log(path) {
        Ok(log) => Box::into_raw(Box::new(FleetSyncHandle { log })),
        Err(e) => {
            warn!(error = %e, "failed to open operation log");
            std::ptr::null_mut()
        }
    }
}

/// Close a previously opened handle.
#[unsafe(no_mangle)]
pub extern "C" fn fleet_sync_close(handle: *mut FleetSyncHandle) {
    if handle.is_null() {
        return;
    }
    unsafe { let _ = Box::from_raw(handle); }
}

/// Queue an operation. `kind` is INSERT, UPDATE or DELETE; `collection` is a
/// table name. Returns the stored operation as JSON, or null on error.
#[unsafe(no_mangle)]
pub extern "C" fn fleet_sync_enqueue(
    handle: *mut FleetSyncHandle,
    kind: *const c_char,
    collection: *const c_char,
    payload_json: *const c_char,
) -> *mut c_char {
    let h = unsafe { handle.as_ref() };
    let args = (ptr_to_str(kind), ptr_to_str(collection), ptr_to_str(payload_json));
    let (kind, collection, payload) = match args {
        (Ok(a), Ok(b), Ok(c)) => (a, b, c),
        _ => return std::ptr::null_mut(),
    };
    let Some(h) = h else { return std::ptr::null_mut() };
    match enqueue_json(&h.log, kind, collection, payload) {
        Ok(json) => to_cstring_ptr(&json),
        Err(e) => {
            warn!(error = %e, "enqueue rejected");
            std::ptr::null_mut()
        }
    }
}

/// All queued operations as a JSON array, in enqueue order. Null on error.
#[unsafe(no_mangle)]
pub extern "C" fn fleet_sync_pending_ops_json(handle: *mut FleetSyncHandle) -> *mut c_char {
    let h = unsafe { handle.as_ref() };
    if let Some(h) = h {
        match h.log.list_all() {
            Ok(ops) => match serde_json::to_string(&ops) {
                Ok(s) => to_cstring_ptr(&s),
                Err(_) => std::ptr::null_mut(),
            },
            Err(_) => std::ptr::null_mut(),
        }
    } else { std::ptr::null_mut() }
}

/// Remove an operation by id. Returns 0 on success (also when absent).
#[unsafe(no_mangle)]
pub extern "C" fn fleet_sync_remove(handle: *mut FleetSyncHandle, op_id: *const c_char) -> c_int {
    let h = unsafe { handle.as_ref() };
    let op_id = match ptr_to_str(op_id) { Ok(s) => s, Err(_) => return 3 };
    if let Some(h) = h {
        match h.log.remove(op_id) { Ok(_) => 0, Err(_) => 1 }
    } else { 2 }
}

/// Number of queued operations, or -1 on error.
#[unsafe(no_mangle)]
pub extern "C" fn fleet_sync_pending_count(handle: *mut FleetSyncHandle) -> i64 {
    let h = unsafe { handle.as_ref() };
    match h.map(|h| h.log.len()) {
        Some(Ok(n)) => n as i64,
        _ => -1,
    }
}

/// Drop every queued operation. Returns 0 on success.
#[unsafe(no_mangle)]
pub extern "C" fn fleet_sync_clear(handle: *mut FleetSyncHandle) -> c_int {
    let h = unsafe { handle.as_ref() };
    if let Some(h) = h {
        match h.log.clear() { Ok(_) => 0, Err(_) => 1 }
    } else { 2 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::QueuedOperation;

    fn take_string(ptr: *mut c_char) -> String {
        assert!(!ptr.is_null());
        let s = unsafe { CStr::from_ptr(ptr) }.to_str().unwrap().to_string();
        fleet_sync_string_free(ptr);
        s
    }

    #[test]
    fn queue_round_trip_through_the_c_abi() {
        let dir = tempfile::tempdir().unwrap();
        let path = CString::new(dir.path().join("queue.db").to_str().unwrap()).unwrap();
        let handle = fleet_sync_open(path.as_ptr());
        assert!(!handle.is_null());

        let kind = CString::new("UPDATE").unwrap();
        let table = CString::new("tasks").unwrap();
        let payload = CString::new(r#"{"id":"t1","status":"completed"}"#).unwrap();
        let queued: QueuedOperation =
            serde_json::from_str(&take_string(fleet_sync_enqueue(
                handle,
                kind.as_ptr(),
                table.as_ptr(),
                payload.as_ptr(),
            )))
                .unwrap();
        assert_eq!(queued.collection, Collection::Tasks);
        assert_eq!(fleet_sync_pending_count(handle), 1);
        fleet_sync_close(handle);

        // Reopening sees the same queue.
        let handle = fleet_sync_open(path.as_ptr());
        let ops: Vec<QueuedOperation> =
            serde_json::from_str(&take_string(fleet_sync_pending_ops_json(handle))).unwrap();
        assert_eq!(ops, vec![queued.clone()]);

        let id = CString::new(queued.id).unwrap();
        assert_eq!(fleet_sync_remove(handle, id.as_ptr()), 0);
        assert_eq!(fleet_sync_remove(handle, id.as_ptr()), 0);
        assert_eq!(fleet_sync_pending_count(handle), 0);
        fleet_sync_close(handle);
    }

    #[test]
    fn rejects_bad_input() {
        let memory = CString::new(":memory:").unwrap();
        let handle = fleet_sync_open(memory.as_ptr());
        let kind = CString::new("DELETE").unwrap();
        let table = CString::new("tasks").unwrap();
        let no_id = CString::new("{}").unwrap();
        let queued = fleet_sync_enqueue(handle, kind.as_ptr(), table.as_ptr(), no_id.as_ptr());
        assert!(queued.is_null());

        let unknown = CString::new("invoices").unwrap();
        let payload = CString::new(r#"{"id":"x"}"#).unwrap();
        let queued = fleet_sync_enqueue(handle, kind.as_ptr(), unknown.as_ptr(), payload.as_ptr());
        assert!(queued.is_null());

        assert_eq!(fleet_sync_remove(std::ptr::null_mut(), memory.as_ptr()), 2);
        assert_eq!(fleet_sync_pending_count(std::ptr::null_mut()), -1);
        assert_eq!(fleet_sync_clear(handle), 0);
        fleet_sync_close(handle);
    }
}
