//! Running-Script Thread Layout
//!
//! The engine schedules each script as a thread with its own locals and
//! instruction pointer. Emitted code addresses this structure directly off
//! the thread base register, so the layout here must match the engine's
//! 32-bit in-memory structure exactly; pointer-sized engine fields are plain
//! `u32`, never host pointers.

/// One local-variable slot. The scripting language stores ints, floats and
/// pointers in the same 4 bytes.
#[repr(C)]
#[derive(Clone, Copy)]
pub union ScriptVar {
    pub dword: u32,
    pub int: i32,
    pub float: f32,
}

pub const NUM_TLS_SLOTS: usize = 34;

/// The engine's running-script structure.
#[repr(C)]
pub struct ScriptThread {
    /// Next script in the scheduling queue (engine pointer).
    pub next: u32,
    /// Previous script in the scheduling queue (engine pointer).
    pub prev: u32,
    /// Thread name, set by the SCRIPT_NAME command.
    pub name: [u8; 8],
    /// Pointer to the start of the script's bytecode.
    pub base_ip: u32,
    /// Current instruction pointer.
    pub ip: u32,
    /// Return stack for GOSUB/RETURN.
    pub stack: [u32; 8],
    /// Current return-stack depth.
    pub sp: u16,
    pub pad_3a: u16,
    /// Thread-local variable slots.
    pub tls: [ScriptVar; NUM_TLS_SLOTS],
    pub is_active: u8,
    /// Result of the last condition (true or false).
    pub cond_result: u8,
    pub mission_cleanup_flag: u8,
    pub external: u8,
    pub unknown_c8: [u8; 4],
    /// Time at which a waiting script resumes.
    pub wake_time: u32,
    /// ANDOR accumulator parameter.
    pub logical_op: u16,
    /// Set when the executing opcode carries the not-flag.
    pub not_flag: u8,
    pub wb_check_enabled: u8,
    pub wasted_or_busted: u8,
    pub unknown_d5: u8,
    pub unknown_d6: u16,
    /// Scene-skip label pointer (engine pointer).
    pub scene_skip: u32,
    pub mission_flag: u8,
    pub pad_dd: [u8; 3],
}

/// Field offsets the emitters address off the thread base register.
pub const THREAD_IP_OFFSET: u32 = 0x14;
pub const THREAD_TLS_OFFSET: u32 = 0x3C;
pub const THREAD_COND_RESULT_OFFSET: u32 = 0xC5;
pub const THREAD_WAKE_TIME_OFFSET: u32 = 0xCC;
pub const THREAD_LOGICAL_OP_OFFSET: u32 = 0xD0;
pub const THREAD_NOT_FLAG_OFFSET: u32 = 0xD2;

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn layout_matches_engine_offsets() {
        assert_eq!(offset_of!(ScriptThread, ip) as u32, THREAD_IP_OFFSET);
        assert_eq!(offset_of!(ScriptThread, tls) as u32, THREAD_TLS_OFFSET);
        assert_eq!(
            offset_of!(ScriptThread, cond_result) as u32,
            THREAD_COND_RESULT_OFFSET
        );
        assert_eq!(
            offset_of!(ScriptThread, wake_time) as u32,
            THREAD_WAKE_TIME_OFFSET
        );
        assert_eq!(
            offset_of!(ScriptThread, logical_op) as u32,
            THREAD_LOGICAL_OP_OFFSET
        );
        assert_eq!(
            offset_of!(ScriptThread, not_flag) as u32,
            THREAD_NOT_FLAG_OFFSET
        );
        assert_eq!(size_of::<ScriptThread>(), 0xE0);
    }
}
