//! Interrupt-driven SPI transaction engine.
//!
//! Task-level code enqueues byte-level commands into a fixed ring buffer;
//! the SPI transfer-complete interrupt walks a per-command state machine,
//! consuming one received byte and emitting the next byte to send per
//! invocation. When a command retires the engine seeds the first byte of the
//! next one straight from the interrupt, so back-to-back commands never wait
//! for a task-level round trip.
//!
//! The ring is single-producer/single-consumer: `end` belongs to the task,
//! `start` to the interrupt. The only cross-context handshake is the
//! idle-to-busy transition on enqueue, which runs inside a critical section.
//! Completion is signalled through a level event flag which coalesces when
//! several commands retire before the task gets around to looking; callers
//! that need per-command tracking poll [`SpiEngine::index_reached`] with a
//! saved producer index.

#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{compiler_fence, Ordering};

/// Hardware bit-rate divider, relative to the peripheral clock.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SpeedDiv {
    Div2,
    Div4,
    Div8,
    Div16,
    Div32,
    Div64,
    Div128,
}

impl SpeedDiv {
    pub fn divider(&self) -> u16 {
        match self {
            Self::Div2 => 2,
            Self::Div4 => 4,
            Self::Div8 => 8,
            Self::Div16 => 16,
            Self::Div32 => 32,
            Self::Div64 => 64,
            Self::Div128 => 128,
        }
    }
}

/// Register-level access to the SPI peripheral.
///
/// `configure` claims the bus pins (SCK/MOSI as outputs, MISO as input),
/// programs the divider and enables the peripheral in master mode with the
/// transfer-complete interrupt; `shutdown` undoes that. `write_data` starts
/// a transfer; `read_data` returns the byte shifted in by the transfer that
/// just completed.
pub trait SpiPhy {
    fn configure(&mut self, speed: SpeedDiv);
    fn shutdown(&mut self);
    fn write_data(&mut self, byte: u8);
    fn read_data(&mut self) -> u8;
}

#[derive(Copy, Clone)]
enum Op {
    ReadBuffer { cur: *mut u8, end: *mut u8 },
    ReadUntilDifferent { dst: *mut u8, target: u8, remain: u8 },
    WriteBuffer { cur: *const u8, end: *const u8 },
    WriteByte { count: usize },
}

/// One queued transaction: the first byte to send plus the variant-specific
/// cursor state the interrupt advances.
#[derive(Copy, Clone)]
struct Command {
    byte: u8,
    op: Op,
}

impl Command {
    const IDLE: Command = Command {
        byte: 0,
        op: Op::WriteByte { count: 0 },
    };
}

/// Producer index snapshot, for completion polling.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CommandIndex(u8);

/// The transaction engine. `N` is the ring capacity and must be a power of
/// two no larger than 256; at most `N - 1` commands can be in flight.
pub struct SpiEngine<P: SpiPhy, const N: usize> {
    phy: P,
    start: u8,
    end: u8,
    event: bool,
    buffer: [Command; N],
}

// Queued commands hold raw cursors into caller buffers. The enqueue safety
// contracts require those buffers to stay valid and untouched until the
// command retires, which also makes them safe to hand across contexts.
unsafe impl<P: SpiPhy + Send, const N: usize> Send for SpiEngine<P, N> {}

impl<P: SpiPhy, const N: usize> SpiEngine<P, N> {
    const CAPACITY_OK: () = assert!(N.is_power_of_two() && N <= 256);
    const MASK: u8 = (N - 1) as u8;

    pub fn new(phy: P, speed: SpeedDiv) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CAPACITY_OK;
        let mut engine = Self {
            phy,
            start: 0,
            end: 0,
            event: false,
            buffer: [Command::IDLE; N],
        };
        engine.phy.configure(speed);
        engine
    }

    /// Disables the peripheral and drops any pending completion event. The
    /// ring must be empty.
    pub fn shutdown(&mut self) {
        debug_assert!(self.end_reached());
        self.phy.shutdown();
        self.event = false;
    }

    /// Queue `data.len()` transfers sending `send_byte` each; received bytes
    /// fill `data` front to back.
    ///
    /// # Safety
    ///
    /// `data` must stay valid and untouched until this command completes
    /// (see [`Self::index_reached`]); the interrupt writes through a raw
    /// cursor into it.
    pub unsafe fn cmd_read_buffer(&mut self, data: &mut [u8], send_byte: u8) {
        debug_assert!(!data.is_empty());
        let range = data.as_mut_ptr_range();
        self.push(Command {
            byte: send_byte,
            op: Op::ReadBuffer {
                cur: range.start,
                end: range.end,
            },
        });
    }

    /// Keep transferring `send_byte` while the received byte equals
    /// `target_byte`, for at most `max_extra` transfers beyond the first.
    /// Every received byte lands in `*dst`, so after completion it holds the
    /// first differing byte, or the last polled byte if the budget ran out.
    ///
    /// # Safety
    ///
    /// `dst` must stay valid and untouched until this command completes.
    pub unsafe fn cmd_read_until_different(
        &mut self,
        target_byte: u8,
        max_extra: u8,
        send_byte: u8,
        dst: &mut u8,
    ) {
        self.push(Command {
            byte: send_byte,
            op: Op::ReadUntilDifferent {
                dst,
                target: target_byte,
                remain: max_extra,
            },
        });
    }

    /// Send `data` in order; received bytes are discarded.
    ///
    /// # Safety
    ///
    /// `data` must stay valid and untouched until this command completes;
    /// the interrupt reads through a raw cursor into it.
    pub unsafe fn cmd_write_buffer(&mut self, data: &[u8]) {
        debug_assert!(!data.is_empty());
        let range = data.as_ptr_range();
        self.push(Command {
            byte: data[0],
            op: Op::WriteBuffer {
                cur: range.start.add(1),
                end: range.end,
            },
        });
    }

    /// Send `byte` a total of `extra_count + 1` times.
    pub fn cmd_write_byte(&mut self, byte: u8, extra_count: usize) {
        self.push(Command {
            byte,
            op: Op::WriteByte { count: extra_count },
        });
    }

    /// Current producer index. Save it right after enqueueing; once
    /// [`Self::index_reached`] returns true for it, every command enqueued
    /// up to that point has completed.
    pub fn get_end_index(&self) -> CommandIndex {
        CommandIndex(self.end)
    }

    /// Whether the consumer has caught up with the saved producer index.
    pub fn index_reached(&mut self, index: CommandIndex) -> bool {
        let start = self.get_start();
        self.end.wrapping_sub(start) & Self::MASK
            <= self.end.wrapping_sub(index.0) & Self::MASK
    }

    /// Whether the ring is empty.
    pub fn end_reached(&mut self) -> bool {
        self.get_start() == self.end
    }

    /// True once any command has completed since the last call; coalesces
    /// multiple completions.
    pub fn take_event(&mut self) -> bool {
        critical_section::with(|_| core::mem::replace(&mut self.event, false))
    }

    /// Drop a pending completion event without looking at it.
    pub fn unset_event(&mut self) {
        critical_section::with(|_| self.event = false);
    }

    /// SPI transfer-complete interrupt body. Consumes the received byte per
    /// the active command, then either continues the command, or retires it,
    /// raises the completion event and seeds the next command's first byte.
    pub fn on_transfer_complete(&mut self) {
        debug_assert!(self.start != self.end);
        let received = self.phy.read_data();
        let cmd = &mut self.buffer[self.start as usize];

        let next = match &mut cmd.op {
            Op::ReadBuffer { cur, end } => {
                unsafe {
                    cur.write(received);
                    *cur = cur.add(1);
                }
                if *cur == *end {
                    None
                } else {
                    Some(cmd.byte)
                }
            }
            Op::ReadUntilDifferent {
                dst,
                target,
                remain,
            } => {
                unsafe { dst.write(received) };
                if received == *target && *remain != 0 {
                    *remain -= 1;
                    Some(cmd.byte)
                } else {
                    None
                }
            }
            Op::WriteBuffer { cur, end } => {
                if *cur == *end {
                    None
                } else {
                    let out = unsafe { cur.read() };
                    *cur = unsafe { cur.add(1) };
                    Some(out)
                }
            }
            Op::WriteByte { count } => {
                if *count == 0 {
                    None
                } else {
                    *count -= 1;
                    Some(cmd.byte)
                }
            }
        };

        if let Some(byte) = next {
            self.phy.write_data(byte);
            return;
        }

        self.event = true;
        self.start = (self.start + 1) & Self::MASK;
        if self.start != self.end {
            let byte = self.buffer[self.start as usize].byte;
            self.phy.write_data(byte);
        }
    }

    /// Access to the underlying peripheral, e.g. for reprogramming the rate
    /// while the ring is idle.
    pub fn phy_mut(&mut self) -> &mut P {
        &mut self.phy
    }

    pub fn phy(&self) -> &P {
        &self.phy
    }

    fn get_start(&mut self) -> u8 {
        critical_section::with(|_| self.start)
    }

    fn is_full(&mut self) -> bool {
        let start = self.get_start();
        self.end.wrapping_sub(start) & Self::MASK == Self::MASK
    }

    fn push(&mut self, cmd: Command) {
        debug_assert!(!self.is_full());
        self.buffer[self.end as usize] = cmd;
        let was_idle = critical_section::with(|_| {
            let was_idle = self.start == self.end;
            self.end = (self.end + 1) & Self::MASK;
            was_idle
        });
        if was_idle {
            // The command record must be observable before the transfer it
            // starts can complete.
            compiler_fence(Ordering::SeqCst);
            self.phy.write_data(self.buffer[self.start as usize].byte);
        }
    }
}
