//! [`Sys`] on top of the Win32 API.

use super::{
    ChildProcess, Completion, Dequeued, ERROR_ABANDONED_WAIT_0, ERROR_IO_PENDING, PipePair,
    ProcessRequest, Sys, WAIT_TIMEOUT, os_error_code,
};
use crate::key::WAKE_KEY;
use crate::pipe::Direction;
use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::io;
use std::iter;
use std::mem::{self, size_of};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use windows_sys::Win32::Foundation::{
    CloseHandle, DUPLICATE_SAME_ACCESS, DuplicateHandle, GENERIC_READ, GENERIC_WRITE, HANDLE,
    INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FILE_FLAG_FIRST_PIPE_INSTANCE, FILE_FLAG_OVERLAPPED, OPEN_EXISTING,
    PIPE_ACCESS_INBOUND, PIPE_ACCESS_OUTBOUND, ReadFile, WriteFile,
};
use windows_sys::Win32::System::Console::{GetStdHandle, STD_ERROR_HANDLE};
use windows_sys::Win32::System::IO::{
    CancelIoEx, CreateIoCompletionPort, GetOverlappedResult, GetQueuedCompletionStatus,
    OVERLAPPED, PostQueuedCompletionStatus,
};
use windows_sys::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JOB_OBJECT_LIMIT_BREAKAWAY_OK,
    JOBOBJECT_ASSOCIATE_COMPLETION_PORT, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    JobObjectAssociateCompletionPortInformation, JobObjectExtendedLimitInformation,
    SetInformationJobObject, TerminateJobObject,
};
use windows_sys::Win32::System::Pipes::{
    CreateNamedPipeW, PIPE_READMODE_BYTE, PIPE_REJECT_REMOTE_CLIENTS, PIPE_TYPE_BYTE, PIPE_WAIT,
};
use windows_sys::Win32::System::Threading::{
    CREATE_NO_WINDOW, CREATE_SUSPENDED, CREATE_UNICODE_ENVIRONMENT, CreateProcessW,
    DeleteProcThreadAttributeList, EXTENDED_STARTUPINFO_PRESENT, GetCurrentProcess,
    GetCurrentProcessId, GetExitCodeProcess, InitializeProcThreadAttributeList,
    LPPROC_THREAD_ATTRIBUTE_LIST, PROCESS_INFORMATION, ResumeThread, STARTF_USESTDHANDLES,
    STARTUPINFOEXW, STARTUPINFOW, TerminateProcess, UpdateProcThreadAttribute,
};

const ERROR_INVALID_HANDLE: i32 = 6;
const PROC_THREAD_ATTRIBUTE_HANDLE_LIST: usize = 0x0002_0002;
const PIPE_BUFFER_SIZE: u32 = 4096;

static PIPE_COUNTER: AtomicUsize = AtomicUsize::new(0);

#[derive(Clone, Copy, Debug, Default)]
pub struct WindowsSys;

/// Closes the handle on drop.
#[derive(Debug)]
pub struct OwnedHandle(HANDLE);

// SAFETY: a HANDLE is an opaque kernel reference usable from any thread.
unsafe impl Send for OwnedHandle {}

impl OwnedHandle {
    fn from_raw(raw: HANDLE) -> io::Result<Self> {
        if raw.is_null() || raw == INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(raw))
    }

    fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        // SAFETY: the handle is owned and closed exactly once.
        unsafe {
            CloseHandle(self.0);
        }
    }
}

/// An `OVERLAPPED` the kernel may write to while a shared reference exists.
pub struct Overlapped(UnsafeCell<OVERLAPPED>);

impl Overlapped {
    fn as_ptr(&self) -> *mut OVERLAPPED {
        self.0.get()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PortRef(usize);

impl PortRef {
    fn raw(self) -> HANDLE {
        self.0 as HANDLE
    }
}

fn check(ok: i32) -> io::Result<()> {
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn started(ok: i32) -> io::Result<bool> {
    if ok != 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(ERROR_IO_PENDING) {
        Ok(false)
    } else {
        Err(err)
    }
}

fn wide(value: &str) -> Vec<u16> {
    value.encode_utf16().chain(iter::once(0)).collect()
}

fn inheritable_attributes() -> SECURITY_ATTRIBUTES {
    SECURITY_ATTRIBUTES {
        nLength: size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: ptr::null_mut(),
        bInheritHandle: 1,
    }
}

fn duplicate_raw(raw: HANDLE, inheritable: bool) -> io::Result<OwnedHandle> {
    let mut out: HANDLE = ptr::null_mut();
    // SAFETY: plain FFI call; `out` is a valid out-pointer.
    let ok = unsafe {
        let process = GetCurrentProcess();
        DuplicateHandle(
            process,
            raw,
            process,
            &mut out,
            0,
            i32::from(inheritable),
            DUPLICATE_SAME_ACCESS,
        )
    };
    check(ok)?;
    OwnedHandle::from_raw(out)
}

/// `PROC_THREAD_ATTRIBUTE_HANDLE_LIST` restricting inheritance to `handles`.
struct HandleList {
    // usize-aligned backing storage for the opaque attribute list.
    _storage: Vec<usize>,
    list: LPPROC_THREAD_ATTRIBUTE_LIST,
}

impl HandleList {
    /// `handles` must outlive the returned list.
    fn new(handles: &[HANDLE]) -> io::Result<Self> {
        let mut size = 0usize;
        // SAFETY: a null list only asks for the required size.
        unsafe {
            InitializeProcThreadAttributeList(ptr::null_mut(), 1, 0, &mut size);
        }
        let mut storage = vec![0usize; size.div_ceil(size_of::<usize>()).max(1)];
        let list = storage.as_mut_ptr() as LPPROC_THREAD_ATTRIBUTE_LIST;
        // SAFETY: `storage` holds at least `size` bytes.
        check(unsafe { InitializeProcThreadAttributeList(list, 1, 0, &mut size) })?;
        let attributes = Self {
            _storage: storage,
            list,
        };
        // SAFETY: the list is initialized; the handle array outlives it.
        check(unsafe {
            UpdateProcThreadAttribute(
                list,
                0,
                PROC_THREAD_ATTRIBUTE_HANDLE_LIST,
                handles.as_ptr() as *const c_void,
                mem::size_of_val(handles),
                ptr::null_mut(),
                ptr::null(),
            )
        })?;
        Ok(attributes)
    }
}

impl Drop for HandleList {
    fn drop(&mut self) {
        // SAFETY: initialized in `new`, deleted once.
        unsafe { DeleteProcThreadAttributeList(self.list) }
    }
}

impl Sys for WindowsSys {
    type Handle = OwnedHandle;
    type Overlapped = Overlapped;
    type Port = PortRef;

    fn create_completion_port(&self) -> io::Result<OwnedHandle> {
        // SAFETY: creates a new port not tied to any file.
        let raw = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, ptr::null_mut(), 0, 1) };
        OwnedHandle::from_raw(raw)
    }

    fn port_ref(&self, port: &OwnedHandle) -> PortRef {
        PortRef(port.raw() as usize)
    }

    fn post_wake(&self, port: PortRef) -> io::Result<()> {
        // SAFETY: the port outlives the worker; no overlapped is attached.
        check(unsafe { PostQueuedCompletionStatus(port.raw(), 0, WAKE_KEY, ptr::null()) })
    }

    fn dequeue(&self, port: PortRef, timeout: Duration) -> Dequeued {
        let mut bytes = 0u32;
        let mut key = 0usize;
        let mut overlapped: *mut OVERLAPPED = ptr::null_mut();
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX - 1);
        // SAFETY: all out-pointers are valid locals.
        let ok = unsafe {
            GetQueuedCompletionStatus(port.raw(), &mut bytes, &mut key, &mut overlapped, millis)
        };
        let error = if ok == 0 {
            let code = os_error_code(&io::Error::last_os_error());
            match code {
                WAIT_TIMEOUT => return Dequeued::Timeout,
                ERROR_ABANDONED_WAIT_0 | ERROR_INVALID_HANDLE => return Dequeued::PortClosed,
                _ if overlapped.is_null() => return Dequeued::Failed(code),
                _ => Some(code),
            }
        } else {
            None
        };
        Dequeued::Packet(Completion {
            key,
            bytes,
            overlapped: overlapped as usize,
            error,
        })
    }

    fn associate(&self, port: PortRef, handle: &OwnedHandle, key: usize) -> io::Result<()> {
        // SAFETY: both handles are open.
        let raw = unsafe { CreateIoCompletionPort(handle.raw(), port.raw(), key, 0) };
        if raw.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn duplicate(&self, handle: &OwnedHandle, inheritable: bool) -> io::Result<OwnedHandle> {
        duplicate_raw(handle.raw(), inheritable)
    }

    fn create_pipe(&self, direction: Direction) -> io::Result<PipePair<OwnedHandle>> {
        // SAFETY: no preconditions.
        let pid = unsafe { GetCurrentProcessId() };
        let serial = PIPE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let name = wide(&format!(r"\\.\pipe\molt-subprocess-{pid}-{serial}"));
        let (server_access, client_access) = match direction {
            Direction::Input => (PIPE_ACCESS_INBOUND, GENERIC_WRITE),
            Direction::Output => (PIPE_ACCESS_OUTBOUND, GENERIC_READ),
        };
        let attributes = inheritable_attributes();
        // SAFETY: `name` is NUL terminated; `attributes` lives across the call.
        let ours = OwnedHandle::from_raw(unsafe {
            CreateNamedPipeW(
                name.as_ptr(),
                server_access | FILE_FLAG_OVERLAPPED | FILE_FLAG_FIRST_PIPE_INSTANCE,
                PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT | PIPE_REJECT_REMOTE_CLIENTS,
                1,
                PIPE_BUFFER_SIZE,
                PIPE_BUFFER_SIZE,
                0,
                &attributes,
            )
        })?;
        // SAFETY: as above; the child's end stays synchronous.
        let theirs = OwnedHandle::from_raw(unsafe {
            CreateFileW(
                name.as_ptr(),
                client_access,
                0,
                &attributes,
                OPEN_EXISTING,
                0,
                ptr::null_mut(),
            )
        })?;
        Ok(PipePair { ours, theirs })
    }

    fn inherited_stderr(&self) -> io::Result<Option<OwnedHandle>> {
        // SAFETY: no preconditions; the returned handle is not owned.
        let raw = unsafe { GetStdHandle(STD_ERROR_HANDLE) };
        if raw.is_null() || raw == INVALID_HANDLE_VALUE {
            return Ok(None);
        }
        duplicate_raw(raw, true).map(Some)
    }

    fn new_overlapped(&self) -> Box<Overlapped> {
        // SAFETY: OVERLAPPED is plain data; all zeroes is its idle state.
        Box::new(Overlapped(UnsafeCell::new(unsafe { mem::zeroed() })))
    }

    unsafe fn start_read(
        &self,
        handle: &OwnedHandle,
        overlapped: &Overlapped,
        buf: *mut u8,
        len: u32,
    ) -> io::Result<bool> {
        let ov = overlapped.as_ptr();
        // SAFETY: the caller keeps `overlapped` and `buf` alive and unmoved
        // until the operation is reaped; no operation is using `ov` now.
        let ok = unsafe {
            ptr::write(ov, mem::zeroed());
            ReadFile(handle.raw(), buf, len, ptr::null_mut(), ov)
        };
        started(ok)
    }

    unsafe fn start_write(
        &self,
        handle: &OwnedHandle,
        overlapped: &Overlapped,
        buf: *const u8,
        len: u32,
    ) -> io::Result<bool> {
        let ov = overlapped.as_ptr();
        // SAFETY: as for `start_read`.
        let ok = unsafe {
            ptr::write(ov, mem::zeroed());
            WriteFile(handle.raw(), buf, len, ptr::null_mut(), ov)
        };
        started(ok)
    }

    fn overlapped_result(
        &self,
        handle: &OwnedHandle,
        overlapped: &Overlapped,
        wait: bool,
    ) -> io::Result<u32> {
        let mut transferred = 0u32;
        // SAFETY: `overlapped` belongs to the last operation on `handle`.
        check(unsafe {
            GetOverlappedResult(
                handle.raw(),
                overlapped.as_ptr(),
                &mut transferred,
                i32::from(wait),
            )
        })?;
        Ok(transferred)
    }

    fn cancel_io(&self, handle: &OwnedHandle, overlapped: &Overlapped) -> io::Result<()> {
        // SAFETY: cancelling only touches the operation identified by `overlapped`.
        check(unsafe { CancelIoEx(handle.raw(), overlapped.as_ptr()) })
    }

    fn create_process(
        &self,
        request: &ProcessRequest<'_, OwnedHandle>,
    ) -> io::Result<ChildProcess<OwnedHandle>> {
        let application = wide(request.application);
        let mut command_line = wide(request.command_line);
        let workdir = request.workdir.map(wide);
        let stderr = request.stderr.map_or(ptr::null_mut(), OwnedHandle::raw);

        let mut inherited = vec![request.stdin.raw(), request.stdout.raw()];
        if !stderr.is_null() && !inherited.contains(&stderr) {
            inherited.push(stderr);
        }
        // Without the list every inheritable handle leaks into the child.
        let handle_list = HandleList::new(&inherited).ok();

        // SAFETY: plain data, zero-initialized.
        let mut startup: STARTUPINFOEXW = unsafe { mem::zeroed() };
        startup.StartupInfo.cb = size_of::<STARTUPINFOW>() as u32;
        startup.StartupInfo.dwFlags = STARTF_USESTDHANDLES;
        startup.StartupInfo.hStdInput = request.stdin.raw();
        startup.StartupInfo.hStdOutput = request.stdout.raw();
        startup.StartupInfo.hStdError = stderr;
        let mut flags = CREATE_NO_WINDOW | CREATE_SUSPENDED | CREATE_UNICODE_ENVIRONMENT;
        if let Some(list) = &handle_list {
            flags |= EXTENDED_STARTUPINFO_PRESENT;
            startup.StartupInfo.cb = size_of::<STARTUPINFOEXW>() as u32;
            startup.lpAttributeList = list.list;
        }

        // SAFETY: every buffer is NUL terminated and outlives the call.
        let mut info: PROCESS_INFORMATION = unsafe { mem::zeroed() };
        check(unsafe {
            CreateProcessW(
                application.as_ptr(),
                command_line.as_mut_ptr(),
                ptr::null(),
                ptr::null(),
                1,
                flags,
                request.environment.as_ptr() as *const c_void,
                workdir.as_ref().map_or(ptr::null(), |dir| dir.as_ptr()),
                ptr::addr_of!(startup).cast::<STARTUPINFOW>(),
                &mut info,
            )
        })?;
        drop(handle_list);
        Ok(ChildProcess {
            process: OwnedHandle(info.hProcess),
            thread: OwnedHandle(info.hThread),
            pid: info.dwProcessId,
        })
    }

    fn resume_thread(&self, thread: &OwnedHandle) -> io::Result<()> {
        // SAFETY: `thread` is a suspended thread handle.
        if unsafe { ResumeThread(thread.raw()) } == u32::MAX {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn terminate_process(&self, process: &OwnedHandle, code: u32) -> io::Result<()> {
        // SAFETY: `process` is open.
        check(unsafe { TerminateProcess(process.raw(), code) })
    }

    fn exit_code(&self, process: &OwnedHandle) -> io::Result<u32> {
        let mut code = 0u32;
        // SAFETY: `process` is open; `code` is a valid out-pointer.
        check(unsafe { GetExitCodeProcess(process.raw(), &mut code) })?;
        Ok(code)
    }

    fn create_job(&self) -> io::Result<OwnedHandle> {
        // SAFETY: anonymous job with default security.
        OwnedHandle::from_raw(unsafe { CreateJobObjectW(ptr::null(), ptr::null()) })
    }

    fn allow_breakaway(&self, job: &OwnedHandle) -> io::Result<()> {
        // SAFETY: plain data, zero-initialized.
        let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { mem::zeroed() };
        info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_BREAKAWAY_OK;
        // SAFETY: `info` matches the information class and outlives the call.
        check(unsafe {
            SetInformationJobObject(
                job.raw(),
                JobObjectExtendedLimitInformation,
                ptr::addr_of!(info).cast::<c_void>(),
                size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
            )
        })
    }

    fn associate_job(&self, job: &OwnedHandle, port: PortRef, key: usize) -> io::Result<()> {
        let info = JOBOBJECT_ASSOCIATE_COMPLETION_PORT {
            CompletionKey: key as *mut c_void,
            CompletionPort: port.raw(),
        };
        // SAFETY: `info` matches the information class and outlives the call.
        check(unsafe {
            SetInformationJobObject(
                job.raw(),
                JobObjectAssociateCompletionPortInformation,
                ptr::addr_of!(info).cast::<c_void>(),
                size_of::<JOBOBJECT_ASSOCIATE_COMPLETION_PORT>() as u32,
            )
        })
    }

    fn assign_to_job(&self, job: &OwnedHandle, process: &OwnedHandle) -> io::Result<()> {
        // SAFETY: both handles are open.
        check(unsafe { AssignProcessToJobObject(job.raw(), process.raw()) })
    }

    fn terminate_job(&self, job: &OwnedHandle, code: u32) -> io::Result<()> {
        // SAFETY: `job` is open.
        check(unsafe { TerminateJobObject(job.raw(), code) })
    }
}
