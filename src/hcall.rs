// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Hypercalls served without leaving real mode.
//!
//! Arguments come in GPR4 onwards, the hypercall number in GPR3. The return
//! code goes back in GPR3 and, for the calls returning a value, the value
//! in GPR4. `H_TOO_HARD` sends the call on to the virtual-mode handler,
//! which sees the registers untouched.

use tce::TceContext;
use vcore::{h_confer, ConferDecision, Timebase, VirtualCore};
use vm_device::{HwRng, RealMode};

pub const H_SUCCESS: i64 = 0;
pub const H_HARDWARE: i64 = -1;
pub const H_PARAMETER: i64 = -4;
pub const H_TOO_HARD: i64 = 9999;

pub const H_GET_TCE: u64 = 0x1c;
pub const H_PUT_TCE: u64 = 0x20;
pub const H_CONFER: u64 = 0xe4;
pub const H_STUFF_TCE: u64 = 0x138;
pub const H_PUT_TCE_INDIRECT: u64 = 0x13c;
pub const H_RANDOM: u64 = 0x300;

const REALMODE_HCALLS: [u64; 6] = [
    H_GET_TCE,
    H_PUT_TCE,
    H_CONFER,
    H_STUFF_TCE,
    H_PUT_TCE_INDIRECT,
    H_RANDOM,
];

/// Whether hypercall `cmd` has a real-mode handler. Hypercall numbers are
/// multiples of four, the low bits are ignored.
pub fn realmode_hcall_implemented(cmd: u64) -> bool {
    REALMODE_HCALLS.iter().any(|h| h / 4 == cmd / 4)
}

/// Hypercall return code for a TCE operation outcome.
pub fn tce_ret<T>(res: &tce::Result<T>) -> i64 {
    match res {
        Ok(_) => H_SUCCESS,
        Err(tce::Error::Parameter) | Err(tce::Error::InvalidAddress(_)) => H_PARAMETER,
        Err(tce::Error::Hardware) => H_HARDWARE,
        Err(tce::Error::TooHard) | Err(tce::Error::Retry) => H_TOO_HARD,
    }
}

pub fn hwrng_present(rng: &dyn HwRng) -> bool {
    rng.present()
}

/// H_RANDOM: one value from the hardware source.
pub fn h_random(rm: &RealMode, rng: &dyn HwRng) -> Result<u64, i64> {
    rng.read(rm).ok_or(H_HARDWARE)
}

/// General purpose registers of the calling vCPU, as far as hypercalls go.
pub type HcallRegs = [u64; 8];

/// What a hardware thread needs to serve the real-mode hypercalls of its
/// current vCPU.
pub struct RealModeHcalls<'a> {
    pub tce: TceContext<'a>,
    pub vcore: &'a VirtualCore,
    pub ptid: u32,
    pub timebase: &'a dyn Timebase,
    pub rng: &'a dyn HwRng,
}

impl RealModeHcalls<'_> {
    /// Serve the hypercall in `gpr[3]`, returning its return code, which is
    /// also stored in `gpr[3]` unless it is `H_TOO_HARD`.
    pub fn dispatch(&self, rm: &RealMode, gpr: &mut HcallRegs) -> i64 {
        let [_, _, _, cmd, a0, a1, a2, a3] = *gpr;

        let (ret, value) = match cmd {
            H_PUT_TCE => (tce_ret(&self.tce.h_put_tce(rm, a0, a1, a2)), None),
            H_GET_TCE => {
                let res = self.tce.h_get_tce(rm, a0, a1);
                (tce_ret(&res), res.ok())
            }
            H_PUT_TCE_INDIRECT => (
                tce_ret(&self.tce.h_put_tce_indirect(rm, a0, a1, a2, a3)),
                None,
            ),
            H_STUFF_TCE => (
                tce_ret(&self.tce.h_stuff_tce(rm, a0, a1, a2, a3)),
                None,
            ),
            H_CONFER => match h_confer(rm, self.vcore, self.ptid, self.timebase) {
                ConferDecision::Continue => (H_SUCCESS, None),
                // Yielding is up to the virtual-mode handler.
                ConferDecision::Yield => (H_TOO_HARD, None),
            },
            H_RANDOM => match h_random(rm, self.rng) {
                Ok(value) => (H_SUCCESS, Some(value)),
                Err(ret) => (ret, None),
            },
            _ => (H_TOO_HARD, None),
        };

        if ret == H_TOO_HARD {
            return ret;
        }
        gpr[3] = ret as u64;
        if let Some(value) = value {
            gpr[4] = value;
        }
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRng(Option<u64>);

    impl HwRng for FixedRng {
        fn present(&self) -> bool {
            self.0.is_some()
        }

        fn read(&self, _rm: &RealMode) -> Option<u64> {
            self.0
        }
    }

    #[test]
    fn test_realmode_hcall_implemented() {
        for cmd in [0x1c, 0x20, 0x22, 0xe4, 0x138, 0x13c, 0x300] {
            assert!(realmode_hcall_implemented(cmd), "{cmd:#x}");
        }
        for cmd in [0x0, 0x4, 0x24, 0x140, 0x304] {
            assert!(!realmode_hcall_implemented(cmd), "{cmd:#x}");
        }
    }

    #[test]
    fn test_tce_return_codes() {
        assert_eq!(tce_ret(&Ok(())), H_SUCCESS);
        assert_eq!(tce_ret::<()>(&Err(tce::Error::Parameter)), H_PARAMETER);
        assert_eq!(tce_ret::<()>(&Err(tce::Error::InvalidAddress(0))), H_PARAMETER);
        assert_eq!(tce_ret::<()>(&Err(tce::Error::Hardware)), H_HARDWARE);
        assert_eq!(tce_ret::<()>(&Err(tce::Error::TooHard)), H_TOO_HARD);
        assert_eq!(tce_ret::<()>(&Err(tce::Error::Retry)), H_TOO_HARD);
    }

    #[test]
    fn test_h_random() {
        // SAFETY: unit tests never block while holding the token.
        let rm = unsafe { RealMode::assume() };
        assert!(hwrng_present(&FixedRng(Some(7))));
        assert_eq!(h_random(&rm, &FixedRng(Some(7))), Ok(7));
        assert!(!hwrng_present(&FixedRng(None)));
        assert_eq!(h_random(&rm, &FixedRng(None)), Err(H_HARDWARE));
    }
}
