//! Drives the host calls end to end against an owned linear memory and an
//! in-memory filesystem.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

use std::sync::{Arc, Mutex};
use wasi_shim::{
    abi::{ErrNo, FileType, IoVec, Pack},
    setup, Detached, FatalShimError, LinearMemory, MemoryFileSystem, MemoryHandler, Options,
    WasiShim,
};

const SUCCESS: u32 = 0;
const BADF: u32 = 8;

/// Scratch addresses in the test memory.
const IOVECS: u32 = 0;
const OUT: u32 = 64;
const RECORD: u32 = 128;
const PATH: u32 = 256;
const DATA: u32 = 512;

type Captured = Arc<Mutex<Vec<String>>>;

struct Session {
    shim: WasiShim,
    memory: LinearMemory,
    stdout: Captured,
    stderr: Captured,
}

fn session_with(options: Options) -> Session {
    let stdout: Captured = Arc::new(Mutex::new(Vec::new()));
    let stderr: Captured = Arc::new(Mutex::new(Vec::new()));
    let (out, err) = (stdout.clone(), stderr.clone());
    let filesystem = MemoryFileSystem::new()
        .with_file("/data.txt", "abcdef")
        .with_file("/dir/inner.txt", "inner")
        .with_dir("/empty");
    let shim = setup(
        filesystem,
        move |text| out.lock().unwrap().push(text.to_string()),
        move |text| err.lock().unwrap().push(text.to_string()),
    )
    .with_options(options);
    Session {
        shim,
        memory: LinearMemory::new(1024),
        stdout,
        stderr,
    }
}

fn session() -> Session {
    session_with(Options::default())
}

impl Session {
    fn iovecs(&mut self, iovecs: &[IoVec]) -> u32 {
        for (i, iovec) in iovecs.iter().enumerate() {
            self.memory
                .write_buffer(IOVECS + 8 * i as u32, &iovec.pack().unwrap())
                .unwrap();
        }
        iovecs.len() as u32
    }

    fn path(&mut self, path: &str) -> u32 {
        self.memory.write_buffer(PATH, path.as_bytes()).unwrap();
        path.len() as u32
    }

    fn open(&mut self, path: &str) -> (u32, u32) {
        let length = self.path(path);
        let status = self
            .shim
            .path_open(&mut self.memory, 3, 0, PATH, length, 0, 0, 0, 0, OUT)
            .unwrap();
        (status, self.memory.read_u32(OUT).unwrap())
    }

    fn read(&mut self, fd: u32, capacity: u32) -> (u32, Vec<u8>) {
        let count = self.iovecs(&[IoVec {
            buf: DATA,
            len: capacity,
        }]);
        let status = self
            .shim
            .fd_read(&mut self.memory, fd, IOVECS, count, OUT)
            .unwrap();
        assert_eq!(status, SUCCESS);
        let read = self.memory.read_u32(OUT).unwrap();
        (read, self.memory.get_slice(DATA, read).unwrap().to_vec())
    }
}

#[test]
fn fd_write_forwards_stdout_in_one_call() {
    let mut s = session();
    s.memory.write_buffer(DATA, b"hello\n").unwrap();
    let count = s.iovecs(&[IoVec { buf: DATA, len: 6 }]);
    assert_eq!(
        s.shim.fd_write(&mut s.memory, 1, IOVECS, count, OUT),
        Ok(SUCCESS)
    );
    assert_eq!(*s.stdout.lock().unwrap(), vec!["hello\n".to_string()]);
    assert_eq!(s.memory.read_u32(OUT).unwrap(), 6);
    assert!(s.stderr.lock().unwrap().is_empty());
}

#[test]
fn fd_write_gathers_every_iovec_in_order() {
    let mut s = session();
    s.memory.write_buffer(DATA, b"wor").unwrap();
    s.memory.write_buffer(DATA + 100, b"ld\n").unwrap();
    s.memory.write_buffer(DATA + 200, b"hello ").unwrap();
    let count = s.iovecs(&[
        IoVec {
            buf: DATA + 200,
            len: 6,
        },
        IoVec { buf: DATA, len: 3 },
        IoVec {
            buf: DATA + 100,
            len: 3,
        },
    ]);
    assert_eq!(
        s.shim.fd_write(&mut s.memory, 2, IOVECS, count, OUT),
        Ok(SUCCESS)
    );
    assert_eq!(*s.stderr.lock().unwrap(), vec!["hello world\n".to_string()]);
    assert_eq!(s.memory.read_u32(OUT).unwrap(), 12);
}

#[test]
fn fd_write_rejects_stdin_and_unknown_descriptors() {
    let mut s = session();
    let count = s.iovecs(&[IoVec { buf: DATA, len: 1 }]);
    assert_eq!(s.shim.fd_write(&mut s.memory, 0, IOVECS, count, OUT), Ok(BADF));
    assert_eq!(s.shim.fd_write(&mut s.memory, 9, IOVECS, count, OUT), Ok(BADF));
    assert_eq!(s.shim.fd_write(&mut s.memory, 3, IOVECS, count, OUT), Ok(BADF));
    assert!(s.stdout.lock().unwrap().is_empty());
}

#[test]
fn fd_write_to_an_opened_file_is_counted() {
    let mut s = session();
    let (_, fd) = s.open("data.txt");
    s.memory.write_buffer(DATA, b"xyz").unwrap();
    let count = s.iovecs(&[IoVec { buf: DATA, len: 3 }]);
    assert_eq!(
        s.shim.fd_write(&mut s.memory, fd, IOVECS, count, OUT),
        Ok(SUCCESS)
    );
    assert_eq!(s.memory.read_u32(OUT).unwrap(), 3);
}

#[test]
fn stdin_is_drained_by_prefix() {
    let mut s = session_with(Options {
        stdin: b"abc".to_vec(),
        ..Options::default()
    });
    let (read, bytes) = s.read(0, 2);
    assert_eq!(read, 2);
    assert_eq!(bytes, b"ab");
    assert_eq!(s.shim.stdin(), b"c");

    s.shim.push_stdin(b"de");
    let (read, bytes) = s.read(0, 8);
    assert_eq!(read, 3);
    assert_eq!(bytes, b"cde");
    assert_eq!(s.read(0, 8).0, 0);
}

#[test]
fn stdin_is_kept_when_the_count_can_not_be_stored() {
    let mut s = session_with(Options {
        stdin: b"abc".to_vec(),
        ..Options::default()
    });
    let count = s.iovecs(&[IoVec { buf: DATA, len: 2 }]);
    assert_eq!(
        s.shim.fd_read(&mut s.memory, 0, IOVECS, count, 5000),
        Ok(BADF)
    );
    assert_eq!(s.shim.stdin(), b"abc");
    assert_eq!(s.read(0, 2), (2, b"ab".to_vec()));
}

#[test]
fn fd_write_emits_nothing_when_the_count_can_not_be_stored() {
    let mut s = session();
    s.memory.write_buffer(DATA, b"hi").unwrap();
    let count = s.iovecs(&[IoVec { buf: DATA, len: 2 }]);
    assert_eq!(
        s.shim.fd_write(&mut s.memory, 1, IOVECS, count, 5000),
        Ok(BADF)
    );
    assert!(s.stdout.lock().unwrap().is_empty());
    assert_eq!(
        s.shim.fd_write(&mut s.memory, 1, IOVECS, count, OUT),
        Ok(SUCCESS)
    );
    assert_eq!(*s.stdout.lock().unwrap(), vec!["hi".to_string()]);
}

#[test]
fn empty_iovec_lists_ignore_their_pointer() {
    let mut s = session();
    assert_eq!(
        s.shim.fd_write(&mut s.memory, 1, 5000, 0, OUT),
        Ok(SUCCESS)
    );
    assert_eq!(s.memory.read_u32(OUT).unwrap(), 0);
    assert_eq!(*s.stdout.lock().unwrap(), vec![String::new()]);
}

#[test]
fn fd_read_rejects_output_streams() {
    let mut s = session();
    let count = s.iovecs(&[IoVec { buf: DATA, len: 4 }]);
    assert_eq!(s.shim.fd_read(&mut s.memory, 1, IOVECS, count, OUT), Ok(BADF));
    assert_eq!(s.shim.fd_read(&mut s.memory, 2, IOVECS, count, OUT), Ok(BADF));
}

#[test]
fn opened_files_are_read_from_the_current_offset() {
    let mut s = session();
    let (status, fd) = s.open("/data.txt");
    assert_eq!(status, SUCCESS);
    assert_eq!(s.read(fd, 4), (4, b"abcd".to_vec()));
    assert_eq!(s.read(fd, 4), (2, b"ef".to_vec()));
    assert_eq!(s.read(fd, 4).0, 0);
}

#[test]
fn path_open_on_a_missing_path_leaves_the_table_unchanged() {
    let mut s = session();
    let before = s.shim.descriptors().len();
    let (status, _) = s.open("missing.txt");
    assert_eq!(status, BADF);
    assert_eq!(s.shim.descriptors().len(), before);
}

#[test]
fn path_open_hands_out_distinct_descriptors() {
    let mut s = session();
    let (first_status, first) = s.open("data.txt");
    let (second_status, second) = s.open("dir/inner.txt");
    assert_eq!((first_status, second_status), (SUCCESS, SUCCESS));
    assert!(first > 3 && second > 3);
    assert_ne!(first, second);
    assert_eq!(s.read(second, 16).1, b"inner");
}

#[test]
fn path_open_relative_to_an_opened_directory() {
    let mut s = session();
    let (_, dir) = s.open("dir");
    let length = s.path("inner.txt");
    assert_eq!(
        s.shim
            .path_open(&mut s.memory, dir, 0, PATH, length, 0, 0, 0, 0, OUT),
        Ok(SUCCESS)
    );
    let fd = s.memory.read_u32(OUT).unwrap();
    assert_eq!(s.read(fd, 16).1, b"inner");

    // Only directories can be opened against.
    let length = s.path("x");
    assert_eq!(
        s.shim
            .path_open(&mut s.memory, fd, 0, PATH, length, 0, 0, 0, 0, OUT),
        Ok(BADF)
    );
}

#[test]
fn path_open_with_the_directory_flag_needs_a_directory() {
    let mut s = session();
    let length = s.path("data.txt");
    assert_eq!(
        s.shim
            .path_open(&mut s.memory, 3, 0, PATH, length, 2, 0, 0, 0, OUT),
        Ok(BADF)
    );
    assert_eq!(s.shim.descriptors().len(), 4);
}

#[test]
fn closed_descriptors_can_not_be_used() {
    let mut s = session();
    let (_, fd) = s.open("data.txt");
    assert_eq!(s.shim.fd_close(fd), Ok(SUCCESS));
    assert_eq!(s.shim.fd_close(fd), Ok(BADF));
    let count = s.iovecs(&[IoVec { buf: DATA, len: 4 }]);
    assert_eq!(s.shim.fd_read(&mut s.memory, fd, IOVECS, count, OUT), Ok(BADF));
    assert_eq!(s.shim.fd_close(1), Ok(SUCCESS));
    assert_eq!(s.shim.descriptors().len(), 4);
}

#[test]
fn only_the_root_is_preopened() {
    let mut s = session();
    assert_eq!(
        s.shim.fd_prestat_get(&mut s.memory, 3, RECORD),
        Ok(SUCCESS)
    );
    assert_eq!(s.memory.read_u8(RECORD).unwrap(), 0);
    assert_eq!(s.memory.read_u32(RECORD + 4).unwrap(), 1);

    assert_eq!(s.shim.fd_prestat_get(&mut s.memory, 4, RECORD), Ok(BADF));
    assert_eq!(s.shim.fd_prestat_get(&mut s.memory, 1, RECORD), Ok(BADF));

    assert_eq!(
        s.shim.fd_prestat_dir_name(&mut s.memory, 3, DATA, 1),
        Ok(SUCCESS)
    );
    assert_eq!(s.memory.read_u8(DATA).unwrap(), b'/');
    assert_eq!(s.shim.fd_prestat_dir_name(&mut s.memory, 3, DATA, 0), Ok(BADF));
    assert_eq!(s.shim.fd_prestat_dir_name(&mut s.memory, 4, DATA, 1), Ok(BADF));
}

#[test]
fn filestat_classifies_paths() {
    let mut s = session();
    let file_type_at = |memory: &LinearMemory| memory.read_u64(RECORD + 16).unwrap();

    let length = s.path("data.txt");
    assert_eq!(
        s.shim
            .path_filestat_get(&mut s.memory, 3, 0, PATH, length, RECORD),
        Ok(SUCCESS)
    );
    assert_eq!(file_type_at(&s.memory), FileType::RegularFile as u64);
    assert_eq!(s.memory.read_u64(RECORD + 32).unwrap(), 6);

    let length = s.path("empty");
    s.shim
        .path_filestat_get(&mut s.memory, 3, 0, PATH, length, RECORD)
        .unwrap();
    assert_eq!(file_type_at(&s.memory), FileType::Directory as u64);

    let length = s.path("/dev/stdout");
    s.shim
        .path_filestat_get(&mut s.memory, 3, 0, PATH, length, RECORD)
        .unwrap();
    assert_eq!(file_type_at(&s.memory), FileType::CharacterDevice as u64);

    let length = s.path("nothing");
    assert_eq!(
        s.shim
            .path_filestat_get(&mut s.memory, 3, 0, PATH, length, RECORD),
        Ok(BADF)
    );
}

#[test]
fn fdstat_classifies_descriptors() {
    let mut s = session();
    let file_type = |s: &mut Session, fd: u32| {
        let status = s.shim.fd_fdstat_get(&mut s.memory, fd, RECORD).unwrap();
        (status, s.memory.read_u8(RECORD).unwrap())
    };
    for fd in 0..3 {
        assert_eq!(
            file_type(&mut s, fd),
            (SUCCESS, FileType::CharacterDevice as u8)
        );
    }
    assert_eq!(file_type(&mut s, 3), (SUCCESS, FileType::Directory as u8));

    let (_, fd) = s.open("data.txt");
    assert_eq!(file_type(&mut s, fd), (SUCCESS, FileType::RegularFile as u8));
    let (_, fd) = s.open("empty");
    assert_eq!(file_type(&mut s, fd), (SUCCESS, FileType::Directory as u8));
    assert_eq!(file_type(&mut s, 42).0, BADF);
}

#[test]
fn open_flags_are_recorded_not_enforced() {
    let mut s = session();
    let length = s.path("data.txt");
    s.shim
        .path_open(&mut s.memory, 3, 0, PATH, length, 0, 0x42, 0x2, 0x1, OUT)
        .unwrap();
    let fd = s.memory.read_u32(OUT).unwrap();
    s.shim.fd_fdstat_get(&mut s.memory, fd, RECORD).unwrap();
    assert_eq!(s.memory.read_u16(RECORD + 2).unwrap(), 0x1);
    assert_eq!(s.memory.read_u64(RECORD + 8).unwrap(), 0x42);
    assert_eq!(s.memory.read_u64(RECORD + 16).unwrap(), 0x2);

    assert_eq!(
        s.shim.fd_fdstat_set_flags(&mut s.memory, fd, 0x4),
        Ok(SUCCESS)
    );
    s.shim.fd_fdstat_get(&mut s.memory, fd, RECORD).unwrap();
    assert_eq!(s.memory.read_u16(RECORD + 2).unwrap(), 0x4);
    // Rights do not restrict reads.
    assert_eq!(s.read(fd, 3).1, b"abc");
}

#[test]
fn fd_seek_is_accepted() {
    let mut s = session();
    let (_, fd) = s.open("data.txt");
    s.read(fd, 2);
    assert_eq!(s.shim.fd_seek(&mut s.memory, fd, 0, 0, OUT), Ok(SUCCESS));
    assert_eq!(s.memory.read_u64(OUT).unwrap(), 2);
    assert_eq!(s.shim.fd_seek(&mut s.memory, 1, 10, 1, OUT), Ok(SUCCESS));
}

#[test]
fn random_get_stays_in_bounds() {
    let mut s = session();
    s.memory.as_bytes_mut()[..64].copy_from_slice(&[0xaa; 64]);
    assert_eq!(s.shim.random_get(&mut s.memory, 16, 32), Ok(SUCCESS));
    let bytes = s.memory.as_bytes();
    assert!(bytes[..16].iter().all(|b| *b == 0xaa));
    assert!(bytes[48..64].iter().all(|b| *b == 0xaa));
    assert!(bytes[16..48].iter().any(|b| *b != 0xaa));

    assert_eq!(s.shim.random_get(&mut s.memory, 1020, 8), Ok(BADF));
}

#[test]
fn proc_exit_is_logged_and_recorded() {
    let mut s = session();
    assert_eq!(s.shim.proc_exit(7), Ok(SUCCESS));
    assert!(s.shim.has_exited());
    assert_eq!(s.shim.exit_code(), Some(7));
    assert_eq!(*s.stderr.lock().unwrap(), vec!["exit 7".to_string()]);
}

#[test]
fn clocks_report_realtime_only() {
    let mut s = session();
    assert_eq!(s.shim.clock_res_get(0), 1_000_000_000);
    assert_eq!(s.shim.clock_res_get(1), ErrNo::Inval as u64);
    assert_eq!(
        s.shim.clock_time_get(&mut s.memory, 0, 1, OUT),
        Ok(SUCCESS)
    );
    assert!(s.memory.read_u64(OUT).unwrap() > 0);

    let mut s = session_with(Options {
        enable_clock: false,
        ..Options::default()
    });
    assert_eq!(s.shim.clock_res_get(0), ErrNo::Access as u64);
    assert_eq!(
        s.shim.clock_time_get(&mut s.memory, 0, 1, OUT),
        Ok(u32::from(ErrNo::Access))
    );
}

#[test]
fn arguments_and_environment_are_served() {
    let mut s = session_with(Options {
        program_arguments: vec!["prog".to_string(), "-v".to_string()],
        environment_variables: vec![("HOME".to_string(), "/".to_string())],
        ..Options::default()
    });
    assert_eq!(
        s.shim.args_sizes_get(&mut s.memory, OUT, OUT + 4),
        Ok(SUCCESS)
    );
    assert_eq!(s.memory.read_u32(OUT).unwrap(), 2);
    assert_eq!(s.memory.read_u32(OUT + 4).unwrap(), 8);

    assert_eq!(s.shim.args_get(&mut s.memory, RECORD, DATA), Ok(SUCCESS));
    assert_eq!(s.memory.read_u32(RECORD).unwrap(), DATA);
    assert_eq!(s.memory.read_u32(RECORD + 4).unwrap(), DATA + 5);
    assert_eq!(s.memory.get_slice(DATA, 8).unwrap(), b"prog\0-v\0");

    assert_eq!(
        s.shim.environ_sizes_get(&mut s.memory, OUT, OUT + 4),
        Ok(SUCCESS)
    );
    assert_eq!(s.memory.read_u32(OUT).unwrap(), 1);
    assert_eq!(s.memory.read_u32(OUT + 4).unwrap(), 7);
    assert_eq!(s.shim.environ_get(&mut s.memory, RECORD, DATA), Ok(SUCCESS));
    assert_eq!(s.memory.get_slice(DATA, 7).unwrap(), b"HOME=/\0");
}

#[test]
fn dispatch_by_name_matches_direct_calls() {
    let mut s = session();
    s.memory.write_buffer(DATA, b"hi").unwrap();
    let count = s.iovecs(&[IoVec { buf: DATA, len: 2 }]);
    let args = [1, IOVECS as u64, count as u64, OUT as u64];
    assert_eq!(
        s.shim.dispatch(&mut s.memory, "fd_write", &args),
        Ok(SUCCESS as u64)
    );
    assert_eq!(*s.stdout.lock().unwrap(), vec!["hi".to_string()]);

    let length = s.path("data.txt");
    let args = [3, 0, PATH as u64, length as u64, 0, 0, 0, 0, OUT as u64];
    assert_eq!(
        s.shim.dispatch(&mut s.memory, "path_open", &args),
        Ok(SUCCESS as u64)
    );
    assert!(s.memory.read_u32(OUT).unwrap() > 3);

    assert_eq!(
        s.shim.dispatch(&mut s.memory, "fd_write", &[1, 2]),
        Err(FatalShimError::BadArgumentsToHostFunction {
            function_name: wasi_shim::WasiAPIName::FD_WRITE
        })
    );
    assert_eq!(
        s.shim.dispatch(&mut s.memory, "poll_oneoff", &[0, 0, 0, 0]),
        Err(FatalShimError::UnknownHostFunction("poll_oneoff".to_string()))
    );
}

#[test]
fn bad_guest_pointers_are_guest_errors() {
    let mut s = session();
    let count = s.iovecs(&[IoVec {
        buf: 1000,
        len: 100,
    }]);
    assert_eq!(s.shim.fd_write(&mut s.memory, 1, IOVECS, count, OUT), Ok(BADF));
    assert_eq!(
        s.shim.fd_write(&mut s.memory, 1, 2000, 1, OUT),
        Ok(BADF)
    );
    assert_eq!(
        s.shim.fd_write(&mut s.memory, 1, IOVECS, u32::MAX, OUT),
        Ok(BADF)
    );
    assert!(s.stdout.lock().unwrap().is_empty());
}

#[test]
fn unattached_memory_is_fatal() {
    let mut s = session();
    let mut detached = Detached;
    assert_eq!(
        s.shim.fd_write(&mut detached, 1, 0, 1, 0),
        Err(FatalShimError::NoMemoryRegistered)
    );
    assert_eq!(
        s.shim.random_get(&mut detached, 0, 4),
        Err(FatalShimError::NoMemoryRegistered)
    );
    assert_eq!(
        s.shim.dispatch(&mut detached, "fd_prestat_get", &[3, 0]),
        Err(FatalShimError::NoMemoryRegistered)
    );
}

#[test]
fn tracing_does_not_change_results() {
    let mut s = session_with(Options {
        enable_strace: true,
        ..Options::default()
    });
    let (status, fd) = s.open("data.txt");
    assert_eq!(status, SUCCESS);
    assert_eq!(s.read(fd, 8), (6, b"abcdef".to_vec()));
    assert_eq!(s.open("missing").0, BADF);
}
