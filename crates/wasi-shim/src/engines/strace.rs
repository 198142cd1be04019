//! strace-like tracing of host calls.
//!
//! A `Strace` is started when a host call is entered, collects the call's
//! arguments as they become printable, and emits one line through `log`
//! (target `strace`) when the result is known.  Records written into guest
//! memory are decoded field by field through their `StructLayout`.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

use super::common::{HostCallError, HostResult};
use crate::{
    abi::{IoVec, Record},
    iovec::gather_bytes,
    memory::MemoryHandler,
};
use log::info;
use std::fmt::{self, Write};

/// The `log` target strace lines are emitted under.
pub const STRACE_TARGET: &str = "strace";

enum TraceState {
    Func,
    Args,
    Result,
}

pub struct Strace {
    enabled: bool,
    state: TraceState,
    line: String,
}

// Convert a vector of bytes into a printable ASCII string.
// The string may contain readable text, which is useful to display,
// but it may also contain binary data, so we cannot decode it as UTF-8.
fn strace_string(bytes: &[u8], max: usize) -> String {
    let mut res = String::from("\"");
    let n = bytes.len().min(max);
    for i in 0..n {
        let byte = bytes[i];
        match byte {
            b'\\' | b'"' => {
                res.push('\\');
                res.push(byte as char);
            }
            0x20..=0x7e => res.push(byte as char),
            b'\t' => res.push_str("\\t"),
            b'\n' => res.push_str("\\n"),
            // The following character is a digit, so use three octal digits.
            _ if i + 1 < n && bytes[i + 1].is_ascii_digit() => {
                let _ = write!(res, "\\{:03o}", byte);
            }
            _ => {
                let _ = write!(res, "\\{:o}", byte);
            }
        }
    }
    res.push('"');
    if bytes.len() > max {
        res.push_str("...")
    }
    res
}

impl Strace {
    pub fn func(enabled: bool, name: &str) -> Self {
        let line = if enabled {
            format!("{}(", name)
        } else {
            String::new()
        };
        Strace {
            enabled,
            state: TraceState::Func,
            line,
        }
    }

    /// Starts a new argument.  Returns `true` if tracing is off and the
    /// argument should be skipped.
    fn arg(&mut self) -> bool {
        if !self.enabled {
            return true;
        }
        match self.state {
            TraceState::Func => self.state = TraceState::Args,
            TraceState::Args => self.line.push_str(", "),
            TraceState::Result => self.line.push_str(" <unexpected arg> "),
        }
        false
    }

    fn push<T: fmt::Display>(&mut self, item: T) {
        let _ = write!(self.line, "{}", item);
    }

    pub fn arg_dec<T: fmt::Display>(&mut self, n: T) {
        if self.arg() {
            return;
        }
        self.push(n)
    }

    pub fn arg_hex<T: fmt::LowerHex>(&mut self, n: T) {
        if self.arg() {
            return;
        }
        let _ = write!(self.line, "0x{:x}", n);
    }

    pub fn arg_dots(&mut self) {
        if self.arg() {
            return;
        }
        self.push("...")
    }

    pub fn arg_path<T: MemoryHandler>(&mut self, mem: &T, adr: u32, len: u32) {
        if self.arg() {
            return;
        }
        match mem.get_slice(adr, len) {
            Ok(bytes) => self.line.push_str(&strace_string(bytes, 1024)),
            Err(_) => self.push("BAD_MEM_REF"),
        }
    }

    pub fn arg_p_u32<T: MemoryHandler>(&mut self, mem: &T, adr: u32) {
        if self.arg() {
            return;
        }
        match mem.read_u32(adr) {
            Ok(x) => self.push(x),
            Err(_) => self.push("BAD_MEM_REF"),
        }
    }

    pub fn arg_p_u64<T: MemoryHandler>(&mut self, mem: &T, adr: u32) {
        if self.arg() {
            return;
        }
        match mem.read_u64(adr) {
            Ok(x) => self.push(x),
            Err(_) => self.push("BAD_MEM_REF"),
        }
    }

    /// The bytes moved by a read or write, truncated to the count the call
    /// wrote at `address`.
    pub fn arg_iovec<T: MemoryHandler>(
        &mut self,
        succeeded: bool,
        mem: &T,
        base: u32,
        count: u32,
        address: u32,
    ) {
        if self.arg() {
            return;
        }
        if !succeeded {
            self.push("_");
            return;
        }
        let len = match mem.read_u32(address) {
            Ok(len) => len,
            Err(_) => return self.push("BAD_IOVEC_LEN"),
        };
        // This copies everything, but it's only used for tracing.
        match mem
            .unpack_array::<IoVec>(base, count)
            .and_then(|iovecs| gather_bytes(mem, &iovecs))
        {
            Ok(mut buf) => {
                buf.truncate(len as usize);
                self.line.push_str(&strace_string(&buf, 32))
            }
            Err(_) => self.push("BAD_IOVEC"),
        }
    }

    /// A record the call wrote at `adr`, as `{field=value, ...}`.
    pub fn arg_record<R: Record, T: MemoryHandler>(&mut self, succeeded: bool, mem: &T, adr: u32) {
        if self.arg() {
            return;
        }
        if !succeeded {
            self.push("_");
            return;
        }
        let layout = R::layout();
        match layout.decode(mem, adr) {
            Ok(values) => {
                let fields = layout
                    .fields()
                    .iter()
                    .zip(values)
                    .map(|(field, value)| format!("{}={}", field.name, value))
                    .collect::<Vec<_>>();
                let _ = write!(self.line, "{}{{{}}}", R::NAME, fields.join(", "));
            }
            Err(_) => self.push("BAD_MEM_REF"),
        }
    }

    pub fn result<R>(&mut self, result: HostResult<R>) -> HostResult<R> {
        if !self.enabled {
            return result;
        }
        if let TraceState::Result = self.state {
            self.line.push_str(" <unexpected result>");
        }
        self.state = TraceState::Result;
        match &result {
            Ok(_) => info!(target: STRACE_TARGET, "{}) = Success", self.line),
            Err(HostCallError::Guest(errno)) => {
                info!(target: STRACE_TARGET, "{}) = {:?}", self.line, errno)
            }
            Err(HostCallError::Fatal(fatal)) => {
                info!(target: STRACE_TARGET, "{}) = FATAL {}", self.line, fatal)
            }
        }
        result
    }

    /// The line collected so far.
    pub fn line(&self) -> &str {
        &self.line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        abi::{FdStat, FileType, Pack, PreopenType, Prestat},
        memory::LinearMemory,
    };

    #[test]
    fn strings_are_escaped_and_truncated() {
        assert_eq!(strace_string(b"hi\n", 32), "\"hi\\n\"");
        assert_eq!(strace_string(b"a\"b", 32), "\"a\\\"b\"");
        assert_eq!(strace_string(&[1, b'7'], 32), "\"\\0017\"");
        assert_eq!(strace_string(&[0xff], 32), "\"\\377\"");
        assert_eq!(strace_string(b"abcdef", 3), "\"abc\"...");
    }

    #[test]
    fn disabled_trace_collects_nothing() {
        let mut strace = Strace::func(false, "fd_close");
        strace.arg_dec(4);
        assert!(strace.result(Ok(())).is_ok());
        assert_eq!(strace.line(), "");
    }

    #[test]
    fn records_are_decoded_through_their_layout() {
        let mut memory = LinearMemory::new(64);
        let prestat = Prestat {
            tag: PreopenType::Dir,
            name_len: 1,
        };
        memory.write_buffer(0, &prestat.pack().unwrap()).unwrap();
        let fdstat = FdStat {
            file_type: FileType::CharacterDevice,
            flags: 0,
            rights_base: 3,
            rights_inheriting: 0,
        };
        memory.write_buffer(8, &fdstat.pack().unwrap()).unwrap();

        let mut strace = Strace::func(true, "fd_prestat_get");
        strace.arg_dec(3);
        strace.arg_record::<Prestat, _>(true, &memory, 0);
        strace.arg_record::<FdStat, _>(true, &memory, 8);
        strace.arg_record::<Prestat, _>(false, &memory, 0);
        assert_eq!(
            strace.line(),
            "fd_prestat_get(3, prestat{type=0, name_len=1}, \
             fdstat{filetype=2, flags=0, rights_base=3, rights_inheriting=0}, _"
        );
    }

    #[test]
    fn iovec_arguments_show_the_transferred_bytes() {
        let mut memory = LinearMemory::new(64);
        memory.write_buffer(32, b"hello").unwrap();
        memory.write_u32(0, 32).unwrap();
        memory.write_u32(4, 5).unwrap();
        memory.write_u32(16, 4).unwrap();

        let mut strace = Strace::func(true, "fd_write");
        strace.arg_iovec(true, &memory, 0, 1, 16);
        strace.arg_p_u32(&memory, 16);
        strace.arg_p_u32(&memory, 1000);
        assert_eq!(strace.line(), "fd_write(\"hell\", 4, BAD_MEM_REF");
    }
}
