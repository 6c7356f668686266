use std::os::fd::RawFd;

use crate::nvme::error::NvmeError;

const NVME_IOCTL_ADMIN_CMD: libc::c_ulong = 0xC048_4E41;
const OPCODE_GET_LOG_PAGE: u8 = 0x02;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct NvmePassthruCmd {
    pub opcode: u8,
    pub flags: u8,
    pub rsvd1: u16,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub metadata: u64,
    pub addr: u64,
    pub metadata_len: u32,
    pub data_len: u32,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
    pub timeout_ms: u32,
    pub result: u32,
}

impl NvmePassthruCmd {
    fn empty() -> Self {
        Self {
            opcode: 0,
            flags: 0,
            rsvd1: 0,
            nsid: 0,
            cdw2: 0,
            cdw3: 0,
            metadata: 0,
            addr: 0,
            metadata_len: 0,
            data_len: 0,
            cdw10: 0,
            cdw11: 0,
            cdw12: 0,
            cdw13: 0,
            cdw14: 0,
            cdw15: 0,
            timeout_ms: 0,
            result: 0,
        }
    }
}

/// Issues Get Log Page for `lid` against namespace `nsid`, filling the
/// caller's buffer. The buffer length sets the transfer size and must be a
/// non-zero multiple of four bytes.
pub fn get_log_page(
    fd: RawFd,
    device_name: &str,
    nsid: u32,
    lid: u8,
    buffer: &mut [u8],
    timeout_ms: u32,
) -> Result<(), NvmeError> {
    let data_len = buffer.len();
    if data_len == 0 || !data_len.is_multiple_of(4) {
        return Err(NvmeError::Parse(format!(
            "log page length {} must be non-zero and divisible by 4",
            data_len
        )));
    }

    let numd_words = (data_len / 4).saturating_sub(1);
    let numd_words = u32::try_from(numd_words)
        .map_err(|_| NvmeError::Parse("log page length is too large".to_string()))?;
    let data_len_u32 = u32::try_from(data_len)
        .map_err(|_| NvmeError::Parse("log page length is too large".to_string()))?;

    let mut cmd = NvmePassthruCmd::empty();
    cmd.opcode = OPCODE_GET_LOG_PAGE;
    cmd.nsid = nsid;
    cmd.addr = buffer.as_mut_ptr() as u64;
    cmd.data_len = data_len_u32;
    cmd.cdw10 = (numd_words << 16) | u32::from(lid);
    cmd.timeout_ms = timeout_ms;

    admin_cmd(fd, device_name, &mut cmd)
}

fn admin_cmd(fd: RawFd, device_name: &str, cmd: &mut NvmePassthruCmd) -> Result<(), NvmeError> {
    let ret = unsafe { libc::ioctl(fd, NVME_IOCTL_ADMIN_CMD as _, cmd as *mut NvmePassthruCmd) };

    if ret < 0 {
        let source = std::io::Error::last_os_error();
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            return Err(NvmeError::PermissionDenied {
                device: device_name.to_string(),
            });
        }
        if source.raw_os_error() == Some(libc::EBUSY) {
            return Err(NvmeError::DeviceBusy {
                device: device_name.to_string(),
            });
        }
        return Err(NvmeError::Ioctl {
            device: device_name.to_string(),
            source,
        });
    }

    Ok(())
}
