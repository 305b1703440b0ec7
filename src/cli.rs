//
// brexos2pmc8 - PMC8 protocol bridge for the Bresser EXOS-2 GoTo mount
// Copyright (c) 2024 the brexos2pmc8 developers
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Interactive mount console.
//!

use crate::mount::{Axis, AxisState, Brexos2, MountError};
use std::io::{BufRead, Read, Write};
use strum::IntoEnumIterator;

fn validated_axis(value: i64) -> Option<Axis> {
    match value {
        0 => Some(Axis::RA),
        1 => Some(Axis::Dec),
        _ => {
            println!("Invalid axis: {}", value);
            None
        }
    }
}

fn validated_rate(value: i64) -> Option<i32> {
    if value.abs() > 5000 {
        println!("Invalid rate: {}", value);
        None
    } else {
        Some(value as i32)
    }
}

/// Reads one command per line until `quit` or end of input.
pub fn run<T: Read + Write + Send + 'static>(mount: &Brexos2<T>) {
    let stdin = std::io::stdin();
    let mut line = String::new();

    loop {
        print!("brexos2>");
        let _ = std::io::stdout().flush();

        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => ()
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        let cmd = match tokens.first() {
            Some(&cmd) => cmd,
            None => continue
        };
        let num = |index: usize| -> i64 {
            tokens.get(index).and_then(|token| token.parse().ok()).unwrap_or(0)
        };

        let result = match cmd {
            "quit" => break,

            "inq" => match validated_axis(num(1)) {
                Some(axis) => match mount.inquiry(axis) {
                    Ok((status, count)) => {
                        println!("Axis:{} status={:02x} count:{}", axis.as_index(), status, count);
                        true
                    },
                    Err(_) => false
                },
                None => true
            },

            "enable" => mount.enable(true).is_ok(),

            "disable" => mount.enable(false).is_ok(),

            "slew" => match (validated_axis(num(1)), validated_rate(num(2))) {
                (Some(axis), Some(rate)) => mount.slew(axis, rate).is_ok(),
                _ => true
            },

            "mslew" => match validated_axis(num(1)) {
                Some(axis) => measure_slew_rate(mount, axis).is_ok(),
                None => true
            },

            "goto" => match (validated_axis(num(1)), validated_rate(num(2))) {
                (Some(axis), Some(rate)) => mount.go_to(axis, rate, num(3) as i32).is_ok(),
                _ => true
            },

            "cmd10" => match mount.cmd_10() {
                Ok(param) => {
                    println!("{:04x}", param);
                    true
                },
                Err(_) => false
            },

            "cmd0f" => match validated_axis(num(1)) {
                Some(_) => mount.cmd_0f(num(2) as u16).is_ok(),
                None => true
            },

            "print_axes" => print_axes(mount).is_ok(),

            _ => true
        };

        if !result {
            println!("Command failed");
        }
    }
}

/// Samples the encoder once per second for 10 seconds and prints the
/// counts-per-second figures plus the overall average.
fn measure_slew_rate<T: Read + Write + Send + 'static>(mount: &Brexos2<T>, axis: Axis)
-> Result<(), MountError> {
    let (_, initial_count) = mount.inquiry(axis)?;
    let mut prev_count = initial_count;
    let mut count = initial_count;
    let t_start = std::time::Instant::now();

    for _ in 0..10 {
        std::thread::sleep(std::time::Duration::from_secs(1));
        let (_, current_count) = mount.inquiry(axis)?;
        count = current_count;
        println!("CPS: {}", count - prev_count);
        prev_count = count;
    }

    let elapsed = t_start.elapsed().as_secs_f64();
    println!("Elapsed: {:.6}, Avg CPS: {}", elapsed, (count - initial_count) as f64 / elapsed);

    Ok(())
}

fn print_axes<T: Read + Write + Send + 'static>(mount: &Brexos2<T>) -> Result<(), MountError> {
    for axis in Axis::iter() {
        print_axis(axis, &mount.axis_state(axis)?);
    }

    Ok(())
}

fn print_axis(axis: Axis, state: &AxisState) {
    println!(
        "Axis {}\n\
         -------------------------\n\
         Rate:          {}\n\
         Slew rate:     {}\n\
         Slew ramp act: {}\n\
         Tracking rate: {}\n\
         Cur trk rate:  {}\n\
         Position:      {:08X}\n\
         Status:        {:02X}\n\
         Goto start:    {:08X}\n\
         Goto target:   {:08X}\n\
         Goto rate:     {:08X}\n",
        axis.as_index(),
        state.rate,
        state.slew_rate,
        state.slew_ramp_active,
        state.tracking_rate,
        state.current_tracking_rate,
        state.position,
        state.status,
        state.goto_start,
        state.goto_target,
        state.goto_rate
    );
}
