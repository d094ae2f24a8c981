use anyhow::{bail, Context, Result};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{self, WaitStatus};
use nix::unistd::Pid;
use serde::{Serialize, Serializer};
use spawn_ptrace::CommandPtraceSpawn;

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::process::Command;

use crate::regs::{Reg, RegisterFile};

/// x86 `INT3`, the one-byte software breakpoint.
const INT3: u8 = 0xcc;

/// Values of the profiled variables, read at one stop of the tracee.
pub type Snapshot = BTreeMap<String, u64>;

/// Reads the machine word at `addr` in the tracee's text.
///
/// `nix` folds the raw peek's errno dance into the `Result`, so a word that
/// happens to equal `-1` is not mistaken for a failure.
fn read_word(pid: Pid, addr: u64) -> Result<u64> {
    let word = ptrace::read(pid, addr as ptrace::AddressType)
        .with_context(|| format!("peek at {:#x} failed", addr))?;

    Ok(word as u64)
}

fn write_word(pid: Pid, addr: u64, word: u64) -> Result<()> {
    unsafe { ptrace::write(pid, addr as ptrace::AddressType, word as *mut libc::c_void) }
        .with_context(|| format!("poke at {:#x} failed", addr))
}

/// Splices `byte` into the low byte of `word`, preserving bits [63:8].
fn patch_low_byte(word: u64, byte: u8) -> u64 {
    (word & !0xff) | u64::from(byte)
}

/// Overwrites the byte at `addr` in the tracee's text, returning the byte
/// that was there. The other seven bytes of the containing word are left
/// untouched.
fn replace_byte(pid: Pid, addr: u64, byte: u8) -> Result<u8> {
    let word = read_word(pid, addr)?;
    write_word(pid, addr, patch_low_byte(word, byte))?;

    Ok(word as u8)
}

/// A software breakpoint: the address it patches and the original
/// instruction byte it displaced.
///
/// The saved byte is captured once, at install time; it is the pristine
/// text byte from before the engine ever touched the address.
#[derive(Clone, Copy, Debug)]
struct Breakpoint {
    addr: u64,
    saved: u8,
}

impl Breakpoint {
    /// Arms a breakpoint at `addr`, saving the displaced byte.
    fn install(pid: Pid, addr: u64) -> Result<Self> {
        let saved = replace_byte(pid, addr, INT3)?;
        log::debug!("breakpoint armed at {:#x} (displaced {:#04x})", addr, saved);

        Ok(Self { addr, saved })
    }

    /// Disarms the breakpoint, putting the original byte back.
    #[allow(dead_code)]
    fn remove(&self, pid: Pid) -> Result<()> {
        replace_byte(pid, self.addr, self.saved)?;

        Ok(())
    }

    /// Lets the tracee execute the displaced instruction, then re-arms.
    ///
    /// On entry the tracee is stopped just past the trap byte, with the
    /// breakpoint still in place. Restores the original byte, rewinds the
    /// instruction pointer onto it, single-steps, and only rewrites `INT3`
    /// once the step's stop has been waited on. Returns `false` if the
    /// tracee exited during the step.
    fn step_past(&self, pid: Pid) -> Result<bool> {
        replace_byte(pid, self.addr, self.saved)?;

        // INT3 is one byte, so after the trap RIP points just past it.
        let mut regs = ptrace::getregs(pid)?;
        regs.rip -= 1;
        ptrace::setregs(pid, regs)?;

        ptrace::step(pid, None)?;
        match wait::waitpid(pid, None)? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
            WaitStatus::Exited(_, status) => {
                log::debug!("tracee exited with {} during single-step", status);
                return Ok(false);
            }
            status => bail!("unexpected stop while single-stepping: {:?}", status),
        }

        replace_byte(pid, self.addr, INT3)?;

        Ok(true)
    }
}

/// One variable whose value changed across a pass of the region.
///
/// Register contents are held unsigned but reported as signed decimals.
#[derive(Debug, Serialize)]
pub struct Diff {
    variable: String,
    #[serde(serialize_with = "as_signed")]
    old: u64,
    #[serde(serialize_with = "as_signed")]
    new: u64,
}

fn as_signed<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_i64(*value as i64)
}

impl fmt::Display for Diff {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "PRF:: {}: {}->{}",
            self.variable, self.old as i64, self.new as i64
        )
    }
}

/// The report for one begin-to-end pass of the region: every variable
/// whose register changed, alphabetically.
#[derive(Debug, Serialize)]
pub struct RegionPass {
    diffs: Vec<Diff>,
}

impl RegionPass {
    /// Writes one report line per changed variable.
    pub fn write_text(&self, w: &mut impl Write) -> Result<()> {
        for diff in &self.diffs {
            writeln!(w, "{}", diff)?;
        }

        Ok(())
    }
}

/// Concretizes every profiled variable against one register file read.
fn take_snapshot(regs: &RegisterFile, var_map: &BTreeMap<String, Reg>) -> Snapshot {
    var_map
        .iter()
        .map(|(variable, reg)| (variable.clone(), reg.value(regs)))
        .collect()
}

/// Diffs two snapshots of the same variables; unchanged variables are
/// omitted. `BTreeMap` iteration keeps the report alphabetical.
fn diff_snapshots(before: &Snapshot, after: &Snapshot) -> Vec<Diff> {
    let mut diffs = Vec::new();

    for (variable, &old) in before {
        let new = after[variable];
        if old != new {
            diffs.push(Diff {
                variable: variable.clone(),
                old,
                new,
            });
        }
    }

    diffs
}

/// Region profiling configuration: the two bracketing addresses, the
/// variable-to-register map, and the target command line.
///
/// The map is read-only once the tracer is built.
#[derive(Debug)]
pub struct Tracer {
    pub begin_addr: u64,
    pub end_addr: u64,
    pub var_map: BTreeMap<String, Reg>,
    pub tracee_name: String,
    pub tracee_args: Vec<String>,
}

impl Tracer {
    /// Launches the target under trace, arms both region breakpoints, and
    /// sets the tracee running toward the first one.
    pub fn trace(&self) -> Result<Tracee> {
        if self.begin_addr == self.end_addr {
            bail!(
                "begin and end addresses are both {:#x}; the region must span at least one instruction",
                self.begin_addr
            );
        }

        let child = Command::new(&self.tracee_name)
            .args(&self.tracee_args)
            .spawn_ptrace()
            .with_context(|| format!("failed to launch {}", self.tracee_name))?;

        log::debug!(
            "spawned {} for tracing as child {}",
            self.tracee_name,
            child.id()
        );

        // The tracee is stopped at its exec boundary, so its text is mapped
        // and safe to patch.
        let pid = Pid::from_raw(child.id() as i32);
        let begin = Breakpoint::install(pid, self.begin_addr)?;
        let end = Breakpoint::install(pid, self.end_addr)?;

        ptrace::cont(pid, None)?;

        Ok(Tracee {
            terminated: false,
            pid,
            tracer: self,
            begin,
            end,
        })
    }
}

/// An actively traced target, alternating between begin and end stops.
///
/// Iterating yields one `RegionPass` per begin/end pair. The loop assumes
/// the region is entered and exited in strict alternation; a trap anywhere
/// other than the expected breakpoint aborts the run.
pub struct Tracee<'a> {
    terminated: bool,
    pid: Pid,
    tracer: &'a Tracer,
    begin: Breakpoint,
    end: Breakpoint,
}

impl<'a> Tracee<'a> {
    /// Blocks until the tracee traps at `bp`, forwarding any other signal
    /// it receives along the way. Returns `false` if the tracee terminated
    /// before reaching the breakpoint.
    fn wait_for(&mut self, bp: Breakpoint) -> Result<bool> {
        loop {
            match wait::waitpid(self.pid, None)? {
                WaitStatus::Exited(_, status) => {
                    log::debug!("tracee exited with {}", status);
                    self.terminated = true;
                    return Ok(false);
                }
                WaitStatus::Signaled(_, signal, _) => {
                    log::warn!("tracee killed by {:?}", signal);
                    self.terminated = true;
                    return Ok(false);
                }
                WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                    let rip = ptrace::getregs(self.pid)?.rip;
                    if rip.wrapping_sub(1) != bp.addr {
                        bail!(
                            "tracee trapped at {:#x}, expected the breakpoint at {:#x}",
                            rip.wrapping_sub(1),
                            bp.addr
                        );
                    }
                    return Ok(true);
                }
                WaitStatus::Stopped(_, signal) => {
                    // Not ours; hand it back and keep waiting for the trap.
                    log::debug!("forwarding {:?} to the tracee", signal);
                    ptrace::cont(self.pid, signal)?;
                }
                status => bail!("unexpected wait status: {:?}", status),
            }
        }
    }

    /// Reads the register file and concretizes every profiled variable.
    fn snapshot(&self) -> Result<Snapshot> {
        let regs = RegisterFile::from(ptrace::getregs(self.pid)?);

        Ok(take_snapshot(&regs, &self.tracer.var_map))
    }

    /// Drives the tracee through one begin/end pass of the region.
    ///
    /// `None` means the tracee terminated; an exit between the begin and
    /// end stops discards the half-taken snapshot.
    fn run_region(&mut self) -> Result<Option<RegionPass>> {
        if !self.wait_for(self.begin)? {
            return Ok(None);
        }
        let before = self.snapshot()?;

        let begin = self.begin;
        if !begin.step_past(self.pid)? {
            self.terminated = true;
            return Ok(None);
        }
        ptrace::cont(self.pid, None)?;

        if !self.wait_for(self.end)? {
            return Ok(None);
        }
        let after = self.snapshot()?;
        let diffs = diff_snapshots(&before, &after);

        let end = self.end;
        if end.step_past(self.pid)? {
            ptrace::cont(self.pid, None)?;
        } else {
            self.terminated = true;
        }

        Ok(Some(RegionPass { diffs }))
    }
}

impl Iterator for Tracee<'_> {
    type Item = Result<RegionPass>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.terminated {
            return None;
        }

        match self.run_region() {
            Ok(Some(pass)) => Some(Ok(pass)),
            Ok(None) => None,
            Err(e) => {
                self.terminated = true;
                Some(Err(e))
            }
        }
    }
}
