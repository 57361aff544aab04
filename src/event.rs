//! The event interface between an instrumentation front-end and the engine.
//!
//! Each record names the acting thread by its front-end uid (`tid` on the
//! wire) plus the event payload. The replay log is JSON lines: one record
//! per line, internally tagged by `ev`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::defs::{Addr, Pc, Uid};

fn default_write_lock() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "ev", rename_all = "snake_case")]
pub enum Event {
    Read {
        tid: Uid,
        pc: Pc,
        addr: Addr,
        size: u64,
    },
    Write {
        tid: Uid,
        pc: Pc,
        addr: Addr,
        size: u64,
    },
    ReadRange {
        tid: Uid,
        pc: Pc,
        addr: Addr,
        size: u64,
    },
    WriteRange {
        tid: Uid,
        pc: Pc,
        addr: Addr,
        size: u64,
    },
    FuncEnter {
        tid: Uid,
        pc: Pc,
    },
    FuncExit {
        tid: Uid,
    },
    ThreadCreate {
        tid: Uid,
        pc: Pc,
        child: Uid,
        #[serde(default)]
        detached: bool,
    },
    /// The started thread acts for itself: `tid` is the child's uid.
    ThreadStart {
        tid: Uid,
        #[serde(default)]
        stack_addr: Addr,
        #[serde(default)]
        stack_size: u64,
    },
    ThreadFinish {
        tid: Uid,
    },
    ThreadJoin {
        tid: Uid,
        pc: Pc,
        target: Uid,
    },
    ThreadDetach {
        tid: Uid,
        pc: Pc,
        target: Uid,
    },
    MutexCreate {
        tid: Uid,
        pc: Pc,
        addr: Addr,
        #[serde(default)]
        rw: bool,
    },
    MutexDestroy {
        tid: Uid,
        pc: Pc,
        addr: Addr,
    },
    MutexLock {
        tid: Uid,
        pc: Pc,
        addr: Addr,
        #[serde(default = "default_write_lock")]
        write: bool,
    },
    MutexUnlock {
        tid: Uid,
        pc: Pc,
        addr: Addr,
        #[serde(default = "default_write_lock")]
        write: bool,
    },
    AtomicLoad {
        tid: Uid,
        pc: Pc,
        addr: Addr,
    },
    AtomicStore {
        tid: Uid,
        pc: Pc,
        addr: Addr,
    },
    SemWait {
        tid: Uid,
        pc: Pc,
        addr: Addr,
    },
    SemPost {
        tid: Uid,
        pc: Pc,
        addr: Addr,
    },
    CondSignal {
        tid: Uid,
        pc: Pc,
        cv: Addr,
    },
    CondWaitBefore {
        tid: Uid,
        pc: Pc,
        cv: Addr,
        #[serde(default)]
        mutex: Option<Addr>,
    },
    CondWaitAfter {
        tid: Uid,
        pc: Pc,
        cv: Addr,
    },
    BarrierInit {
        tid: Uid,
        pc: Pc,
        addr: Addr,
        #[serde(default)]
        count: u32,
    },
    BarrierWaitBefore {
        tid: Uid,
        pc: Pc,
        addr: Addr,
    },
    BarrierWaitAfter {
        tid: Uid,
        pc: Pc,
        addr: Addr,
    },
    Malloc {
        tid: Uid,
        pc: Pc,
        addr: Addr,
        size: u64,
    },
    Free {
        tid: Uid,
        pc: Pc,
        addr: Addr,
        #[serde(default)]
        size: u64,
    },
    IgnoreBegin {
        tid: Uid,
    },
    IgnoreEnd {
        tid: Uid,
    },
    IgnoreReadsBegin {
        tid: Uid,
    },
    IgnoreReadsEnd {
        tid: Uid,
    },
    IgnoreWritesBegin {
        tid: Uid,
    },
    IgnoreWritesEnd {
        tid: Uid,
    },
    IgnoreSyncBegin {
        tid: Uid,
    },
    IgnoreSyncEnd {
        tid: Uid,
    },
    Publish {
        tid: Uid,
        pc: Pc,
        addr: Addr,
        size: u64,
    },
    Unpublish {
        tid: Uid,
        pc: Pc,
        addr: Addr,
        size: u64,
    },
    ThreadName {
        tid: Uid,
        name: String,
    },
    LockName {
        tid: Uid,
        addr: Addr,
        name: String,
    },
}

impl Event {
    /// Front-end uid of the acting thread.
    pub fn actor(&self) -> Uid {
        use Event::*;
        match self {
            Read { tid, .. }
            | Write { tid, .. }
            | ReadRange { tid, .. }
            | WriteRange { tid, .. }
            | FuncEnter { tid, .. }
            | FuncExit { tid }
            | ThreadCreate { tid, .. }
            | ThreadStart { tid, .. }
            | ThreadFinish { tid }
            | ThreadJoin { tid, .. }
            | ThreadDetach { tid, .. }
            | MutexCreate { tid, .. }
            | MutexDestroy { tid, .. }
            | MutexLock { tid, .. }
            | MutexUnlock { tid, .. }
            | AtomicLoad { tid, .. }
            | AtomicStore { tid, .. }
            | SemWait { tid, .. }
            | SemPost { tid, .. }
            | CondSignal { tid, .. }
            | CondWaitBefore { tid, .. }
            | CondWaitAfter { tid, .. }
            | BarrierInit { tid, .. }
            | BarrierWaitBefore { tid, .. }
            | BarrierWaitAfter { tid, .. }
            | Malloc { tid, .. }
            | Free { tid, .. }
            | IgnoreBegin { tid }
            | IgnoreEnd { tid }
            | IgnoreReadsBegin { tid }
            | IgnoreReadsEnd { tid }
            | IgnoreWritesBegin { tid }
            | IgnoreWritesEnd { tid }
            | IgnoreSyncBegin { tid }
            | IgnoreSyncEnd { tid }
            | Publish { tid, .. }
            | Unpublish { tid, .. }
            | ThreadName { tid, .. }
            | LockName { tid, .. } => *tid,
        }
    }
}

/// Sized access log2, or `None` for sizes the sized path does not take.
pub fn size_log(size: u64) -> Option<u32> {
    match size {
        1 => Some(0),
        2 => Some(1),
        4 => Some(2),
        8 => Some(3),
        _ => None,
    }
}

/// Replay input: path or stdin.
#[derive(Debug, Clone)]
pub enum TraceInput {
    Stdin,
    File(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_write_event() {
        let ev: Event =
            serde_json::from_str(r#"{"ev":"write","tid":1,"pc":256,"addr":32768,"size":4}"#)
                .unwrap();
        assert_eq!(
            ev,
            Event::Write {
                tid: 1,
                pc: 256,
                addr: 32768,
                size: 4
            }
        );
        assert_eq!(ev.actor(), 1);
    }

    #[test]
    fn test_mutex_lock_defaults_to_write_mode() {
        let ev: Event =
            serde_json::from_str(r#"{"ev":"mutex_lock","tid":2,"pc":0,"addr":4096}"#).unwrap();
        assert_eq!(
            ev,
            Event::MutexLock {
                tid: 2,
                pc: 0,
                addr: 4096,
                write: true
            }
        );
    }

    #[test]
    fn test_thread_create_roundtrip() {
        let ev = Event::ThreadCreate {
            tid: 0,
            pc: 0x10,
            child: 7,
            detached: true,
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(ev, back);
    }

    #[test]
    fn test_unknown_event_rejected() {
        let err = serde_json::from_str::<Event>(r#"{"ev":"teleport","tid":1}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_size_log() {
        assert_eq!(size_log(1), Some(0));
        assert_eq!(size_log(8), Some(3));
        assert_eq!(size_log(3), None);
        assert_eq!(size_log(16), None);
    }
}
