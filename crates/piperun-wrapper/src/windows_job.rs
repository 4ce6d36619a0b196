use std::io;

/// Job object that takes the wrapped child (and its descendants) down with it.
///
/// Closing the handle terminates every process in the job, so holding this for
/// the wrapper's lifetime ties the tree to the wrapper.
pub(crate) struct JobObjectHandle {
    handle: windows::Win32::Foundation::HANDLE,
}

// SAFETY: a job HANDLE is an opaque kernel object reference usable from any thread.
unsafe impl Send for JobObjectHandle {}

impl Drop for JobObjectHandle {
    fn drop(&mut self) {
        use windows::Win32::Foundation::CloseHandle;
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}

pub(crate) fn create_job_object() -> io::Result<JobObjectHandle> {
    use windows::Win32::System::JobObjects::{
        CreateJobObjectW, JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
        JobObjectExtendedLimitInformation, SetInformationJobObject,
    };

    unsafe {
        let job = CreateJobObjectW(None, None).map_err(io::Error::other)?;
        let guard = JobObjectHandle { handle: job };

        let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = std::mem::zeroed();
        info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;

        SetInformationJobObject(
            guard.handle,
            JobObjectExtendedLimitInformation,
            (&raw const info).cast(),
            std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
        )
        .map_err(io::Error::other)?;

        Ok(guard)
    }
}

pub(crate) fn assign_to_job(job: &JobObjectHandle, pid: u32) -> io::Result<()> {
    use windows::Win32::Foundation::CloseHandle;
    use windows::Win32::System::JobObjects::AssignProcessToJobObject;
    use windows::Win32::System::Threading::{OpenProcess, PROCESS_SET_QUOTA, PROCESS_TERMINATE};

    unsafe {
        let process = OpenProcess(PROCESS_SET_QUOTA | PROCESS_TERMINATE, false, pid)
            .map_err(io::Error::other)?;
        let assigned = AssignProcessToJobObject(job.handle, process).map_err(io::Error::other);
        let _ = CloseHandle(process);
        assigned
    }
}

/// Deliver `CTRL_BREAK_EVENT` to the process group rooted at `pid`.
pub(crate) fn send_ctrl_break(pid: u32) -> io::Result<()> {
    use windows::Win32::System::Console::{CTRL_BREAK_EVENT, GenerateConsoleCtrlEvent};

    unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid).map_err(io::Error::other) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_object_creation_and_drop() {
        let first = create_job_object();
        let second = create_job_object();
        assert!(first.is_ok());
        assert!(second.is_ok());
    }

    #[test]
    fn test_assign_unknown_pid_fails() {
        let job = create_job_object().unwrap();
        assert!(assign_to_job(&job, u32::MAX).is_err());
    }
}
