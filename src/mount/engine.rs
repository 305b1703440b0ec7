//
// brexos2pmc8 - PMC8 protocol bridge for the Bresser EXOS-2 GoTo mount
// Copyright (c) 2024 the brexos2pmc8 developers
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Mount control engine.
//!
//! Owns the serial port and the per-axis state, and runs a 10 Hz manager
//! task which advances slew/goto ramps, modulates the tracking rate and
//! powers the motors down after a period of idleness.
//!

use crate::mount::{codec, Axis, MountError};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// Ticks with both axes enabled and idle before the motors are switched off (~10 s).
const POWER_SAVE_IDLE_TICKS: i32 = 100;

pub mod status {
    /// The axis is in free-run slew mode (i.e., NOT executing a goto).
    pub const SLEWING: u8 = 0x04;
    pub const DISABLED: u8 = 0x08;
    #[allow(dead_code)]
    pub const DIRECTION: u8 = 0x80;
}

mod rate {
    pub const MIN_GOTO: i32 = 20;
    pub const MAX_GOTO: i32 = 4000;
    pub const MAX_SLEW: i32 = MAX_GOTO;
    /// Requests at or beyond this magnitude slew at `MAX_SLEW`, reached via the ramp.
    pub const SLEW_RAMP_THRESHOLD: i32 = 1600;
    pub const SLEW_RAMP_STEP: i32 = 200;
    pub const MAX_GUIDING_PULSE: i32 = 5;
}

/// State of a single axis; updated by engine operations and the manager task.
#[derive(Copy, Clone, Debug)]
pub struct AxisState {
    /// Last commanded signed slew rate; the sign encodes direction, zero is idle.
    pub rate: i32,
    /// Slew rate most recently requested by a caller.
    pub slew_rate: i32,
    pub slew_ramp_active: bool,
    pub tracking_rate: i32,
    /// Tracking rate actually applied this tick (after modulation).
    pub current_tracking_rate: i32,
    /// Last observed encoder count.
    pub position: i32,
    /// Last observed status bits.
    pub status: u8,
    pub goto_start: i32,
    pub goto_target: i32,
    pub goto_rate: i32
}

impl Default for AxisState {
    fn default() -> AxisState {
        AxisState{
            rate: 0,
            slew_rate: 0,
            slew_ramp_active: false,
            tracking_rate: 0,
            current_tracking_rate: 0,
            position: 0,
            status: status::DISABLED,
            goto_start: 0,
            goto_target: 0,
            goto_rate: 0
        }
    }
}

/// Everything behind the engine mutex: the port and all mutable state.
///
/// Holding the port here makes every serial exchange atomic with respect to
/// the manager task; a command's response is always read before another
/// command can be written.
struct Shared<T> {
    port: T,
    axes: [AxisState; 2],
    axes_idle_count: i32,
    tick_count: u64
}

impl<T: Read + Write> Shared<T> {
    fn write_command(&mut self, cmd: &[u8]) -> Result<([u8; codec::MAX_FRAME_LEN], usize), MountError> {
        self.port.write_all(cmd)?;
        let mut buf = [0u8; codec::MAX_FRAME_LEN];
        let frame_len = codec::read_response(&mut self.port, &mut buf)?;
        Ok((buf, frame_len))
    }

    fn cmd_enable_motors(&mut self, enable: bool) -> Result<(), MountError> {
        // Fire-and-forget: the mount never acknowledges this command.
        self.port.write_all(&codec::enable_motors(enable))?;
        Ok(())
    }

    fn cmd_inquiry(&mut self, axis: Axis) -> Result<(u8, i32), MountError> {
        let (buf, frame_len) = self.write_command(&codec::inquiry(axis))?;
        codec::parse_inquiry(&buf[..frame_len])
    }

    fn cmd_slew(&mut self, axis: Axis, rate: i32) -> Result<(), MountError> {
        let (direction, magnitude) = if rate > 0 { (1, rate) } else { (0, -rate) };
        let magnitude = magnitude.min(rate::MAX_SLEW);

        self.axes[axis.as_index()].rate = rate;
        self.write_command(&codec::slew(axis, direction, magnitude as u16)).map(|_| ())
    }

    fn cmd_go_to(&mut self, axis: Axis, rate: i32, target: i32) -> Result<(), MountError> {
        let rate = rate.abs();
        self.write_command(&codec::go_to(axis, rate as u16, target as u32)).map(|_| ())
    }

    /// Inquires the axis and caches its status and position.
    fn update_axis(&mut self, axis: Axis) -> Result<(), MountError> {
        let (status, position) = self.cmd_inquiry(axis)?;
        let state = &mut self.axes[axis.as_index()];
        state.status = status;
        state.position = position;
        Ok(())
    }

    fn tick(&mut self) {
        self.manage_axis(Axis::RA);
        self.manage_axis(Axis::Dec);
        self.manage_power_save();
        self.tick_count += 1;
    }

    fn manage_axis(&mut self, axis: Axis) {
        let idx = axis.as_index();

        match self.cmd_inquiry(axis) {
            Ok((status, position)) => {
                self.axes[idx].status = status;
                self.axes[idx].position = position;
            },

            Err(e) => {
                log::debug!("axis {}: inquiry failed ({:?}); skipping tick", idx, e);
                return;
            }
        }

        let state = self.axes[idx];

        if (state.status & status::DISABLED) != 0 {
            self.axes[idx].rate = 0;
            return;
        }

        if (state.status & status::SLEWING) == 0 {
            // A goto is running; keep feeding it a rate that decelerates into the target.
            if state.goto_target != state.goto_start {
                let distance = (state.goto_target - state.position).abs()
                    .min((state.position - state.goto_start).abs());
                let rate = (((distance as f64).sqrt() * 10.0).round() as i32)
                    .max(rate::MIN_GOTO)
                    .min(rate::MAX_GOTO);

                self.axes[idx].goto_rate = rate;

                log::debug!(
                    "goto ramp: axis={} status={:02X} start={:08X} target={:08X} rate={}",
                    idx, state.status, state.goto_start, state.goto_target, rate
                );

                if let Err(e) = self.cmd_go_to(axis, rate, state.goto_target) {
                    log::debug!("axis {}: goto ramp command failed ({:?})", idx, e);
                }
            }
        } else if state.slew_ramp_active {
            let mut new_rate = state.rate;

            if new_rate < state.slew_rate {
                new_rate = (new_rate + rate::SLEW_RAMP_STEP).min(state.slew_rate);
            } else if new_rate > state.slew_rate {
                new_rate = (new_rate - rate::SLEW_RAMP_STEP).max(state.slew_rate);
            }

            self.axes[idx].slew_ramp_active = new_rate != state.slew_rate;

            if state.rate != new_rate {
                log::debug!("slew ramp: axis={} status={:02X} rate={}", idx, state.status, new_rate);

                if let Err(e) = self.cmd_slew(axis, new_rate) {
                    log::debug!("axis {}: slew ramp command failed ({:?})", idx, e);
                }
            }
        } else if axis == Axis::RA && state.tracking_rate != 0 {
            // Modulate the tracking rate to slow it down a bit.
            let new_tracking_rate = if self.tick_count % 6 == 0 {
                (state.tracking_rate - 1).max(0)
            } else {
                state.tracking_rate
            };

            self.axes[idx].current_tracking_rate = new_tracking_rate;

            if state.slew_rate > -rate::MAX_GUIDING_PULSE && state.slew_rate < rate::MAX_GUIDING_PULSE {
                let new_rate = (new_tracking_rate + state.slew_rate).max(0);

                if state.rate != new_rate {
                    if let Err(e) = self.cmd_slew(Axis::RA, new_rate) {
                        log::debug!("tracking slew command failed ({:?})", e);
                    }
                }
            }
        }
    }

    fn axis_enabled_and_slewing(&self, axis: Axis) -> bool {
        (self.axes[axis.as_index()].status & (status::DISABLED | status::SLEWING)) == status::SLEWING
    }

    fn manage_power_save(&mut self) {
        if self.axis_enabled_and_slewing(Axis::RA) && self.axis_enabled_and_slewing(Axis::Dec)
            && self.axes[0].rate == 0 && self.axes[1].rate == 0 {

            let idle_count = self.axes_idle_count;
            self.axes_idle_count += 1;

            if idle_count >= POWER_SAVE_IDLE_TICKS {
                log::debug!("axes idle for {} ticks; disabling motors", idle_count);

                if let Err(e) = self.cmd_enable_motors(false) {
                    log::debug!("power-save motor disable failed ({:?})", e);
                }
            }

            return;
        }

        self.axes_idle_count = 0;
    }
}

struct ManagerThread {
    stop_sender: crossbeam::channel::Sender<()>,
    join_handle: std::thread::JoinHandle<()>
}

pub struct Brexos2<T: Read + Write + Send + 'static> {
    shared: Arc<Mutex<Shared<T>>>,
    manager: Option<ManagerThread>
}

impl<T: Read + Write + Send + 'static> Brexos2<T> {
    /// Takes ownership of a configured serial port, switches the motors off
    /// and takes a first status reading of both axes.
    #[must_use]
    pub fn new(port: T) -> Result<Brexos2<T>, MountError> {
        let mut shared = Shared{
            port,
            axes: [AxisState::default(); 2],
            axes_idle_count: 0,
            tick_count: 0
        };

        shared.cmd_enable_motors(false)?;
        shared.update_axis(Axis::RA)?;
        shared.update_axis(Axis::Dec)?;

        Ok(Brexos2{ shared: Arc::new(Mutex::new(shared)), manager: None })
    }

    /// Starts the manager task; a no-op if it is already running.
    pub fn start_manager(&mut self) {
        if self.manager.is_some() { return; }

        let shared = Arc::clone(&self.shared);
        let (stop_sender, stop_receiver) = crossbeam::channel::bounded::<()>(1);

        let join_handle = std::thread::spawn(move || {
            loop {
                match stop_receiver.recv_timeout(TICK_INTERVAL) {
                    Err(crossbeam::channel::RecvTimeoutError::Timeout) => (),
                    _ => break
                }

                match shared.lock() {
                    Ok(mut shared) => shared.tick(),
                    Err(_) => break
                }
            }
        });

        self.manager = Some(ManagerThread{ stop_sender, join_handle });
    }

    fn lock(&self) -> Result<MutexGuard<Shared<T>>, MountError> {
        self.shared.lock().map_err(|_| MountError::Lock)
    }

    #[must_use]
    pub fn enable(&self, enable: bool) -> Result<(), MountError> {
        self.lock()?.cmd_enable_motors(enable)
    }

    /// Asks the mount for the axis status and encoder count. Does not touch
    /// the cached axis state.
    #[must_use]
    pub fn inquiry(&self, axis: Axis) -> Result<(u8, i32), MountError> {
        self.lock()?.cmd_inquiry(axis)
    }

    /// Snapshot of the cached axis state.
    #[must_use]
    pub fn axis_state(&self, axis: Axis) -> Result<AxisState, MountError> {
        Ok(self.lock()?.axes[axis.as_index()])
    }

    /// Requests slewing at the given signed rate.
    ///
    /// Rates at or beyond the ramp threshold slew at the maximum rate,
    /// approached gradually by the manager task. While tracking is active,
    /// requests within the guiding-pulse window are blended into the
    /// current tracking rate instead.
    ///
    #[must_use]
    pub fn slew(&self, axis: Axis, requested_rate: i32) -> Result<(), MountError> {
        let mut shared = self.lock()?;
        let mut rate = requested_rate;

        let result = (|| {
            shared.update_axis(axis)?;
            let state = shared.axes[axis.as_index()];

            if (state.status & status::DISABLED) != 0 {
                if rate == 0 && state.tracking_rate == 0 {
                    return Ok(()); // motors already off, nothing to stop
                }

                shared.cmd_enable_motors(true)?;
            }

            // no free slewing during a goto
            if (state.status & status::SLEWING) == 0 {
                return Err(MountError::NotSlewing);
            }

            if state.tracking_rate == 0
                || state.slew_ramp_active
                || rate > rate::MAX_GUIDING_PULSE
                || rate < -rate::MAX_GUIDING_PULSE {

                if rate <= -rate::SLEW_RAMP_THRESHOLD {
                    rate = -rate::MAX_SLEW;
                } else if rate >= rate::SLEW_RAMP_THRESHOLD {
                    rate = rate::MAX_SLEW;
                } else if !state.slew_ramp_active
                    && state.rate > -rate::SLEW_RAMP_THRESHOLD
                    && state.rate < rate::SLEW_RAMP_THRESHOLD {

                    // both the current and the requested rate are in the
                    // low-speed band; no ramp needed
                    return shared.cmd_slew(axis, rate);
                }

                shared.axes[axis.as_index()].slew_ramp_active = true;
                return Ok(());
            }

            // tracking is on and this is a guiding pulse; blend it in
            let new_rate = (state.current_tracking_rate + rate).max(0);
            shared.cmd_slew(axis, new_rate)
        })();

        shared.axes[axis.as_index()].slew_rate = rate;
        result
    }

    /// Sets the tracking rate (the sign of `rate` is ignored). The motor is
    /// only commanded if the axis is idle; otherwise the manager task picks
    /// the new rate up on its next tick.
    #[must_use]
    pub fn track(&self, axis: Axis, rate: i32) -> Result<(), MountError> {
        let rate = rate.abs();
        let mut shared = self.lock()?;

        let result = (|| {
            shared.update_axis(axis)?;
            let state = shared.axes[axis.as_index()];

            if (state.status & status::DISABLED) != 0 {
                if rate == 0 {
                    return Ok(()); // motors already off when turning tracking off
                }

                shared.cmd_enable_motors(true)?;
            }

            if (state.status & status::SLEWING) != 0 && !state.slew_ramp_active && state.slew_rate == 0 {
                shared.cmd_slew(axis, rate)
            } else {
                Err(MountError::Busy)
            }
        })();

        let state = &mut shared.axes[axis.as_index()];
        state.tracking_rate = rate;
        state.current_tracking_rate = rate;
        result
    }

    /// Starts a goto toward `target` (a 24-bit signed encoder count).
    ///
    /// Motion always begins at the minimum goto rate and is ramped up by the
    /// manager task from there; `rate` is accepted for interface
    /// compatibility only. Ignored if a goto is already running.
    ///
    #[must_use]
    pub fn go_to(&self, axis: Axis, _rate: i32, target: i32) -> Result<(), MountError> {
        let mut shared = self.lock()?;

        let (status, position) = shared.cmd_inquiry(axis)?;

        if (status & status::DISABLED) != 0 {
            shared.cmd_enable_motors(true)?;
        }

        if (status & status::SLEWING) != 0 {
            let state = &mut shared.axes[axis.as_index()];
            state.goto_start = position;
            state.goto_target = target;
            state.goto_rate = rate::MIN_GOTO;
            state.rate = 0;

            shared.cmd_go_to(axis, rate::MIN_GOTO, target)?;
        }

        Ok(())
    }

    /// Current axis rate as seen by a client: 0 when disabled, the requested
    /// slew rate in free-run mode, or the goto rate in goto units otherwise.
    #[must_use]
    pub fn get_rate(&self, axis: Axis) -> Result<i32, MountError> {
        let mut shared = self.lock()?;
        shared.update_axis(axis)?;
        let state = &shared.axes[axis.as_index()];

        if (state.status & status::DISABLED) != 0 {
            Ok(0)
        } else if (state.status & status::SLEWING) != 0 {
            Ok(state.slew_rate)
        } else {
            Ok(state.goto_rate * 25)
        }
    }

    pub fn cmd_0f(&self, param: u16) -> Result<(), MountError> {
        self.lock()?.write_command(&codec::cmd_0f(param)).map(|_| ())
    }

    pub fn cmd_10(&self) -> Result<u16, MountError> {
        let mut shared = self.lock()?;
        let (buf, frame_len) = shared.write_command(&codec::cmd_10())?;
        codec::parse_cmd10(&buf[..frame_len])
    }
}

impl<T: Read + Write + Send + 'static> Drop for Brexos2<T> {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.take() {
            let _ = manager.stop_sender.send(());
            let _ = manager.join_handle.join();
        }
    }
}
