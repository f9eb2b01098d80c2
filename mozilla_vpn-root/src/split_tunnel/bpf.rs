//! cgroup v2 classification with a `BPF_PROG_TYPE_CGROUP_SOCK` program.
//!
//! The program stores the bypass mark on every socket created inside an
//! attached cgroup (or its descendants) and always allows the creation:
//!
//! ```text
//! r2 = fwmark
//! *(u32 *)(r1 + offsetof(struct bpf_sock, mark)) = r2
//! r0 = 1
//! exit
//! ```

use async_trait::async_trait;

use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;

use super::{Error, SplitTunnel, cgroup_dir};

const BPF_PROG_LOAD: libc::c_long = 5;
const BPF_PROG_ATTACH: libc::c_long = 8;
const BPF_PROG_DETACH: libc::c_long = 9;

const BPF_PROG_TYPE_CGROUP_SOCK: u32 = 9;
const BPF_CGROUP_INET_SOCK_CREATE: u32 = 2;
const BPF_F_ALLOW_MULTI: u32 = 2;

const SOCK_MARK_OFFSET: i16 = 16;
const LICENSE: &str = "Dual MPL/GPL";

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Insn {
    code: u8,
    /// dst in the low nibble, src in the high one
    regs: u8,
    off: i16,
    imm: i32,
}

impl Insn {
    const fn new(code: u8, dst: u8, src: u8, off: i16, imm: i32) -> Self {
        Insn {
            code,
            regs: (src << 4) | (dst & 0x0f),
            off,
            imm,
        }
    }
}

/// The socket marking program for `fwmark`.
pub fn program(fwmark: u32) -> [Insn; 4] {
    const MOV64_IMM: u8 = 0xb7;
    const STX_MEM_W: u8 = 0x63;
    const EXIT: u8 = 0x95;
    // the immediate is reinterpreted as u32 by the verifier for a 32 bit store
    let imm = i32::from_ne_bytes(fwmark.to_ne_bytes());
    [
        Insn::new(MOV64_IMM, 2, 0, 0, imm),
        Insn::new(STX_MEM_W, 1, 2, SOCK_MARK_OFFSET, 0),
        Insn::new(MOV64_IMM, 0, 0, 0, 1),
        Insn::new(EXIT, 0, 0, 0, 0),
    ]
}

#[repr(C)]
#[derive(Default)]
struct ProgLoadAttr {
    prog_type: u32,
    insn_cnt: u32,
    insns: u64,
    license: u64,
    log_level: u32,
    log_size: u32,
    log_buf: u64,
    kern_version: u32,
    prog_flags: u32,
    prog_name: [u8; 16],
    prog_ifindex: u32,
    expected_attach_type: u32,
}

#[repr(C)]
#[derive(Default)]
struct AttachAttr {
    target_fd: u32,
    attach_bpf_fd: u32,
    attach_type: u32,
    attach_flags: u32,
}

fn bpf<T>(op: &'static str, cmd: libc::c_long, attr: &T) -> Result<libc::c_long, Error> {
    // SAFETY: attr is a live, fully initialised repr(C) bpf_attr prefix and
    // its size is passed along.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd,
            attr as *const T as *const libc::c_void,
            std::mem::size_of::<T>() as libc::c_uint,
        )
    };
    if ret < 0 {
        return Err(Error::Bpf {
            op,
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(ret)
}

fn load(fwmark: u32) -> Result<OwnedFd, Error> {
    let insns = program(fwmark);
    let license = CString::new(LICENSE).map_err(|e| Error::Unsupported(e.to_string()))?;
    let mut name = [0u8; 16];
    name[..6].copy_from_slice(b"mozvpn");
    let attr = ProgLoadAttr {
        prog_type: BPF_PROG_TYPE_CGROUP_SOCK,
        insn_cnt: insns.len() as u32,
        insns: insns.as_ptr() as u64,
        license: license.as_ptr() as u64,
        prog_name: name,
        expected_attach_type: BPF_CGROUP_INET_SOCK_CREATE,
        ..Default::default()
    };
    let fd = bpf("load", BPF_PROG_LOAD, &attr)?;
    let fd = i32::try_from(fd).map_err(|e| Error::Unsupported(e.to_string()))?;
    // SAFETY: a successful BPF_PROG_LOAD returns a new descriptor we own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn attach_attr(cgroup: &OwnedFd, prog: &OwnedFd) -> AttachAttr {
    AttachAttr {
        target_fd: cgroup.as_raw_fd() as u32,
        attach_bpf_fd: prog.as_raw_fd() as u32,
        attach_type: BPF_CGROUP_INET_SOCK_CREATE,
        attach_flags: BPF_F_ALLOW_MULTI,
    }
}

pub struct BpfSplitTunnel {
    unified: PathBuf,
    attached: BTreeMap<String, OwnedFd>,
    program: OwnedFd,
}

impl BpfSplitTunnel {
    /// Loads the program. Fails without `CAP_BPF` or on kernels lacking
    /// cgroup socket hooks.
    pub fn load(unified: PathBuf, fwmark: u32) -> Result<Self, Error> {
        let program = load(fwmark)?;
        tracing::debug!(fwmark = format!("{fwmark:#x}"), "socket marking program loaded");
        Ok(BpfSplitTunnel {
            unified,
            attached: BTreeMap::new(),
            program,
        })
    }

    fn detach(&mut self, cgroup: &str) -> Result<(), Error> {
        let Some(dir) = self.attached.remove(cgroup) else {
            return Ok(());
        };
        bpf("detach", BPF_PROG_DETACH, &attach_attr(&dir, &self.program))?;
        Ok(())
    }
}

#[async_trait]
impl SplitTunnel for BpfSplitTunnel {
    fn kind(&self) -> &'static str {
        "cgroup2-bpf"
    }

    async fn exclude_cgroup(&mut self, cgroup: &str) -> Result<(), Error> {
        if self.attached.contains_key(cgroup) {
            return Ok(());
        }
        let path = cgroup_dir(&self.unified, cgroup)?;
        let dir: OwnedFd = File::open(&path)?.into();
        bpf("attach", BPF_PROG_ATTACH, &attach_attr(&dir, &self.program))?;
        tracing::debug!(cgroup, "socket marking attached");
        self.attached.insert(cgroup.to_string(), dir);
        Ok(())
    }

    async fn reset_cgroup(&mut self, cgroup: &str) -> Result<(), Error> {
        self.detach(cgroup)
    }

    async fn reset_all(&mut self) -> Result<(), Error> {
        let cgroups: Vec<String> = self.attached.keys().cloned().collect();
        let mut first_error = None;
        for cgroup in cgroups {
            if let Err(e) = self.detach(&cgroup) {
                tracing::warn!(error = %e, cgroup, "failed to detach socket marking");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn excluded(&self) -> Vec<String> {
        self.attached.keys().cloned().collect()
    }
}

impl Drop for BpfSplitTunnel {
    fn drop(&mut self) {
        let cgroups: Vec<String> = self.attached.keys().cloned().collect();
        for cgroup in cgroups {
            if let Err(error) = self.detach(&cgroup) {
                tracing::warn!(%error, cgroup, "failed to detach socket marking");
            }
        }
    }
}
