// FHPP register frame for the CMMO-ST drive controller
//
// The controller exchanges a fixed block of four 16-bit holding registers:
// word0 = [CCON | CPOS] (status: [SCON | SPOS])
// word1 = [CDIR | preselection] (status: [SDIR | velocity %])
// word2 = setpoint/position high 16 bits
// word3 = setpoint/position low 16 bits
//
// Brake and halt are active-low on the wire ("release" bits), so they are
// inverted on the way in and out.

use serde::{Deserialize, Serialize};

/// Register address of the four-word frame
pub const FRAME_ADDRESS: u16 = 0x0000;
/// Number of 16-bit words in the frame
pub const FRAME_WORDS: usize = 4;

/// Raw register frame as exchanged on the wire
pub type Frame = [u16; FRAME_WORDS];

// CCON / SCON (word0 high byte)
const CON_ENABLE: u8 = 0;
const CON_OPERATION_ENABLE: u8 = 1;
const CCON_BRAKE_RELEASE: u8 = 2;
const CCON_RESET: u8 = 3;
const SCON_WARNING: u8 = 2;
const SCON_FAULT: u8 = 3;
const SCON_LOAD_APPLIED: u8 = 4;
const CON_FCT_BLOCKED: u8 = 5;
const CON_OPERATION_MODE: u8 = 6; // 2 bits

// CPOS / SPOS (word0 low byte)
const POS_HALT_RELEASE: u8 = 0;
const CPOS_POSITIONING_START: u8 = 1;
const CPOS_HOMING_START: u8 = 2;
const CPOS_JOG_POSITIVE: u8 = 3;
const CPOS_JOG_NEGATIVE: u8 = 4;
const CPOS_TEACH: u8 = 5;
const CPOS_CLEAR_PATH: u8 = 6;
const SPOS_ACK_START: u8 = 1;
const SPOS_MOTION_COMPLETE: u8 = 2;
const SPOS_ACK_TEACH: u8 = 3;
const SPOS_MOVING: u8 = 4;
const SPOS_FOLLOWING_ERROR: u8 = 5;
const SPOS_STILL_MONITORING: u8 = 6;
const SPOS_REFERENCE_SET: u8 = 7;

// CDIR / SDIR (word1 high byte)
const DIR_SETPOINT_MODE: u8 = 0;
const DIR_CONTROL_MODE: u8 = 1; // 2 bits
const SDIR_SPEED_LIMIT: u8 = 4;
const DIR_STROKE_LIMIT: u8 = 5;

/// Operation mode (CCON/SCON B6-B7)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OpMode {
    #[default]
    RecSelect = 0b00,
    DirectApp = 0b01,
    Reserved1 = 0b10,
    Reserved2 = 0b11,
}

impl OpMode {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => OpMode::RecSelect,
            0b01 => OpMode::DirectApp,
            0b10 => OpMode::Reserved1,
            _ => OpMode::Reserved2,
        }
    }
}

/// Setpoint interpretation (CDIR/SDIR B0)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SetpointMode {
    #[default]
    Absolute = 0,
    Relative = 1,
}

impl SetpointMode {
    fn from_bit(bit: bool) -> Self {
        if bit {
            SetpointMode::Relative
        } else {
            SetpointMode::Absolute
        }
    }
}

/// Control mode (CDIR/SDIR B1-B2)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ControlMode {
    #[default]
    Positioning = 0b00,
    Power = 0b01,
    Speed = 0b10,
    Reserved = 0b11,
}

impl ControlMode {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => ControlMode::Positioning,
            0b01 => ControlMode::Power,
            0b10 => ControlMode::Speed,
            _ => ControlMode::Reserved,
        }
    }
}

/// Control registers written to the drive controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRegisters {
    // CCON
    pub drive_enabled: bool,
    pub operation_enabled: bool,
    pub brake_active: bool,
    pub reset: bool,
    pub fct_blocked: bool,
    pub operation_mode: OpMode,
    // CPOS
    pub halt_active: bool,
    pub positioning_start: bool,
    pub homing_start: bool,
    pub jog_positive: bool,
    pub jog_negative: bool,
    pub teach: bool,
    pub clear_path: bool,
    // CDIR
    pub setpoint_mode: SetpointMode,
    pub control_mode: ControlMode,
    pub stroke_limit_bypass: bool,
    /// Velocity preselection in percent (direct mode)
    pub preselection: u8,
    /// Target position in micrometers
    pub setpoint: i32,
}

impl Default for ControlRegisters {
    /// Mechanically locked: brake engaged, halt asserted, drive disabled
    fn default() -> Self {
        Self {
            drive_enabled: false,
            operation_enabled: false,
            brake_active: true,
            reset: false,
            fct_blocked: false,
            operation_mode: OpMode::RecSelect,
            halt_active: true,
            positioning_start: false,
            homing_start: false,
            jog_positive: false,
            jog_negative: false,
            teach: false,
            clear_path: false,
            setpoint_mode: SetpointMode::Absolute,
            control_mode: ControlMode::Positioning,
            stroke_limit_bypass: false,
            preselection: 0,
            setpoint: 0,
        }
    }
}

impl ControlRegisters {
    /// Disable, halt, brake and reset asserted
    pub fn safed(&self) -> Self {
        Self {
            drive_enabled: false,
            operation_enabled: false,
            halt_active: true,
            brake_active: true,
            reset: true,
            positioning_start: false,
            homing_start: false,
            jog_positive: false,
            jog_negative: false,
            ..*self
        }
    }

    /// Pack into the four-word command frame
    pub fn encode(&self) -> Frame {
        let ccon = bit(self.drive_enabled, CON_ENABLE)
            | bit(self.operation_enabled, CON_OPERATION_ENABLE)
            | bit(!self.brake_active, CCON_BRAKE_RELEASE)
            | bit(self.reset, CCON_RESET)
            | bit(self.fct_blocked, CON_FCT_BLOCKED)
            | ((self.operation_mode as u8 & 0b11) << CON_OPERATION_MODE);

        let cpos = bit(!self.halt_active, POS_HALT_RELEASE)
            | bit(self.positioning_start, CPOS_POSITIONING_START)
            | bit(self.homing_start, CPOS_HOMING_START)
            | bit(self.jog_positive, CPOS_JOG_POSITIVE)
            | bit(self.jog_negative, CPOS_JOG_NEGATIVE)
            | bit(self.teach, CPOS_TEACH)
            | bit(self.clear_path, CPOS_CLEAR_PATH);

        let cdir = bit(self.setpoint_mode == SetpointMode::Relative, DIR_SETPOINT_MODE)
            | ((self.control_mode as u8 & 0b11) << DIR_CONTROL_MODE)
            | bit(self.stroke_limit_bypass, DIR_STROKE_LIMIT);

        let (high, low) = split_i32(self.setpoint);
        [
            join_bytes(ccon, cpos),
            join_bytes(cdir, self.preselection),
            high,
            low,
        ]
    }

    /// Unpack a command frame (the controller-side view)
    pub fn decode(frame: &Frame) -> Self {
        let [ccon, cpos] = frame[0].to_be_bytes();
        let [cdir, preselection] = frame[1].to_be_bytes();

        Self {
            drive_enabled: test(ccon, CON_ENABLE),
            operation_enabled: test(ccon, CON_OPERATION_ENABLE),
            brake_active: !test(ccon, CCON_BRAKE_RELEASE),
            reset: test(ccon, CCON_RESET),
            fct_blocked: test(ccon, CON_FCT_BLOCKED),
            operation_mode: OpMode::from_bits(ccon >> CON_OPERATION_MODE),
            halt_active: !test(cpos, POS_HALT_RELEASE),
            positioning_start: test(cpos, CPOS_POSITIONING_START),
            homing_start: test(cpos, CPOS_HOMING_START),
            jog_positive: test(cpos, CPOS_JOG_POSITIVE),
            jog_negative: test(cpos, CPOS_JOG_NEGATIVE),
            teach: test(cpos, CPOS_TEACH),
            clear_path: test(cpos, CPOS_CLEAR_PATH),
            setpoint_mode: SetpointMode::from_bit(test(cdir, DIR_SETPOINT_MODE)),
            control_mode: ControlMode::from_bits(cdir >> DIR_CONTROL_MODE),
            stroke_limit_bypass: test(cdir, DIR_STROKE_LIMIT),
            preselection,
            setpoint: join_i32(frame[2], frame[3]),
        }
    }
}

/// Status registers read from the drive controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRegisters {
    // SCON
    pub drive_enabled: bool,
    pub operation_enabled: bool,
    pub warning_present: bool,
    pub fault_present: bool,
    pub load_applied: bool,
    pub fct_blocked: bool,
    pub operation_mode: OpMode,
    // SPOS
    pub halt_active: bool,
    pub ack_start: bool,
    pub motion_complete: bool,
    pub ack_teach: bool,
    pub is_moving: bool,
    pub following_error: bool,
    pub still_monitoring: bool,
    pub reference_set: bool,
    // SDIR
    pub setpoint_mode: SetpointMode,
    pub control_mode: ControlMode,
    pub speed_limit_reached: bool,
    pub stroke_limit_reached: bool,
    /// Actual velocity in percent
    pub velocity_percent: u8,
    /// Actual position in encoder ticks
    pub position: i32,
}

impl Default for StatusRegisters {
    fn default() -> Self {
        Self {
            drive_enabled: false,
            operation_enabled: false,
            warning_present: false,
            fault_present: false,
            load_applied: false,
            fct_blocked: false,
            operation_mode: OpMode::RecSelect,
            halt_active: true,
            ack_start: false,
            motion_complete: false,
            ack_teach: false,
            is_moving: false,
            following_error: false,
            still_monitoring: false,
            reference_set: false,
            setpoint_mode: SetpointMode::Absolute,
            control_mode: ControlMode::Positioning,
            speed_limit_reached: false,
            stroke_limit_reached: false,
            velocity_percent: 0,
            position: 0,
        }
    }
}

impl StatusRegisters {
    /// Unpack the four-word status frame
    pub fn decode(frame: &Frame) -> Self {
        let [scon, spos] = frame[0].to_be_bytes();
        let [sdir, velocity_percent] = frame[1].to_be_bytes();

        Self {
            drive_enabled: test(scon, CON_ENABLE),
            operation_enabled: test(scon, CON_OPERATION_ENABLE),
            warning_present: test(scon, SCON_WARNING),
            fault_present: test(scon, SCON_FAULT),
            load_applied: test(scon, SCON_LOAD_APPLIED),
            fct_blocked: test(scon, CON_FCT_BLOCKED),
            operation_mode: OpMode::from_bits(scon >> CON_OPERATION_MODE),
            halt_active: !test(spos, POS_HALT_RELEASE),
            ack_start: test(spos, SPOS_ACK_START),
            motion_complete: test(spos, SPOS_MOTION_COMPLETE),
            ack_teach: test(spos, SPOS_ACK_TEACH),
            is_moving: test(spos, SPOS_MOVING),
            following_error: test(spos, SPOS_FOLLOWING_ERROR),
            still_monitoring: test(spos, SPOS_STILL_MONITORING),
            reference_set: test(spos, SPOS_REFERENCE_SET),
            setpoint_mode: SetpointMode::from_bit(test(sdir, DIR_SETPOINT_MODE)),
            control_mode: ControlMode::from_bits(sdir >> DIR_CONTROL_MODE),
            speed_limit_reached: test(sdir, SDIR_SPEED_LIMIT),
            stroke_limit_reached: test(sdir, DIR_STROKE_LIMIT),
            velocity_percent,
            position: join_i32(frame[2], frame[3]),
        }
    }

    /// Pack into the four-word status frame (the controller-side view)
    pub fn encode(&self) -> Frame {
        let scon = bit(self.drive_enabled, CON_ENABLE)
            | bit(self.operation_enabled, CON_OPERATION_ENABLE)
            | bit(self.warning_present, SCON_WARNING)
            | bit(self.fault_present, SCON_FAULT)
            | bit(self.load_applied, SCON_LOAD_APPLIED)
            | bit(self.fct_blocked, CON_FCT_BLOCKED)
            | ((self.operation_mode as u8 & 0b11) << CON_OPERATION_MODE);

        let spos = bit(!self.halt_active, POS_HALT_RELEASE)
            | bit(self.ack_start, SPOS_ACK_START)
            | bit(self.motion_complete, SPOS_MOTION_COMPLETE)
            | bit(self.ack_teach, SPOS_ACK_TEACH)
            | bit(self.is_moving, SPOS_MOVING)
            | bit(self.following_error, SPOS_FOLLOWING_ERROR)
            | bit(self.still_monitoring, SPOS_STILL_MONITORING)
            | bit(self.reference_set, SPOS_REFERENCE_SET);

        let sdir = bit(self.setpoint_mode == SetpointMode::Relative, DIR_SETPOINT_MODE)
            | ((self.control_mode as u8 & 0b11) << DIR_CONTROL_MODE)
            | bit(self.speed_limit_reached, SDIR_SPEED_LIMIT)
            | bit(self.stroke_limit_reached, DIR_STROKE_LIMIT);

        let (high, low) = split_i32(self.position);
        [
            join_bytes(scon, spos),
            join_bytes(sdir, self.velocity_percent),
            high,
            low,
        ]
    }
}

fn bit(value: bool, offset: u8) -> u8 {
    (value as u8) << offset
}

fn test(byte: u8, offset: u8) -> bool {
    (byte >> offset) & 1 == 1
}

fn join_bytes(high: u8, low: u8) -> u16 {
    u16::from_be_bytes([high, low])
}

/// Split a signed 32-bit value into (high16, low16)
fn split_i32(value: i32) -> (u16, u16) {
    let raw = value as u32;
    ((raw >> 16) as u16, (raw & 0xFFFF) as u16)
}

/// Join (high16, low16) into a signed 32-bit value
fn join_i32(high: u16, low: u16) -> i32 {
    (((high as u32) << 16) | low as u32) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_frame_is_locked() {
        let frame = ControlRegisters::default().encode();
        // Brake and halt engaged means both release bits are clear
        assert_eq!(frame, [0x0000, 0x0000, 0x0000, 0x0000]);
    }

    #[test]
    fn test_operation_mode_bit_isolation() {
        let base = ControlRegisters {
            drive_enabled: true,
            reset: true,
            ..ControlRegisters::default()
        };
        let direct = ControlRegisters {
            operation_mode: OpMode::DirectApp,
            ..base
        };

        let diff = base.encode()[0] ^ direct.encode()[0];
        // Only B6 of CCON (bit 14 of word0) flips for DIRECTAPP
        assert_eq!(diff, 0x4000);
        assert_eq!(direct.encode()[0] & 0xC000, 0x4000);

        let reserved = ControlRegisters {
            operation_mode: OpMode::Reserved2,
            ..ControlRegisters::default()
        };
        assert_eq!(reserved.encode()[0], 0xC000);
    }

    #[test]
    fn test_active_low_bits() {
        let released = ControlRegisters {
            brake_active: false,
            halt_active: false,
            ..ControlRegisters::default()
        };
        let frame = released.encode();
        assert_eq!(frame[0], 0x0401); // CCON B2, CPOS B0

        let status = StatusRegisters::decode(&[0x0001, 0, 0, 0]);
        assert!(!status.halt_active);
        let status = StatusRegisters::decode(&[0x0000, 0, 0, 0]);
        assert!(status.halt_active);
    }

    #[test]
    fn test_cdir_and_preselection() {
        let regs = ControlRegisters {
            setpoint_mode: SetpointMode::Relative,
            control_mode: ControlMode::Speed,
            stroke_limit_bypass: true,
            preselection: 100,
            ..ControlRegisters::default()
        };
        // CDIR = B0 | (0b10 << 1) | B5 = 0x25, preselection = 0x64
        assert_eq!(regs.encode()[1], 0x2564);
    }

    #[test]
    fn test_setpoint_split() {
        let regs = ControlRegisters {
            setpoint: 150_000,
            ..ControlRegisters::default()
        };
        let frame = regs.encode();
        assert_eq!(frame[2], 0x0002);
        assert_eq!(frame[3], 0x49F0);

        let regs = ControlRegisters {
            setpoint: -90_000,
            ..ControlRegisters::default()
        };
        let frame = regs.encode();
        assert_eq!(frame[2], 0xFFFE);
        assert_eq!(frame[3], 0xA070);
        assert_eq!(ControlRegisters::decode(&frame).setpoint, -90_000);
    }

    #[test]
    fn test_status_decode_fields() {
        // SCON: enable, op enable, fault, DIRECTAPP; SPOS: motion complete, reference set
        let frame = [0x4B84, 0x1032, 0x0000, 0x0064];
        let status = StatusRegisters::decode(&frame);
        assert!(status.drive_enabled);
        assert!(status.operation_enabled);
        assert!(!status.warning_present);
        assert!(status.fault_present);
        assert_eq!(status.operation_mode, OpMode::DirectApp);
        assert!(status.halt_active);
        assert!(status.motion_complete);
        assert!(status.reference_set);
        assert!(!status.is_moving);
        assert!(status.speed_limit_reached);
        assert!(!status.stroke_limit_reached);
        assert_eq!(status.velocity_percent, 0x32);
        assert_eq!(status.position, 100);
    }

    #[test]
    fn test_control_frame_decodes_as_status() {
        // Control and status frames share the mirrored fields bit for bit
        let modes = [
            OpMode::RecSelect,
            OpMode::DirectApp,
            OpMode::Reserved1,
            OpMode::Reserved2,
        ];
        let controls = [
            ControlMode::Positioning,
            ControlMode::Power,
            ControlMode::Speed,
            ControlMode::Reserved,
        ];

        for (i, &operation_mode) in modes.iter().enumerate() {
            for (j, &control_mode) in controls.iter().enumerate() {
                let regs = ControlRegisters {
                    drive_enabled: i % 2 == 0,
                    operation_enabled: j % 2 == 1,
                    brake_active: i == j,
                    fct_blocked: j == 3,
                    operation_mode,
                    halt_active: (i + j) % 2 == 0,
                    setpoint_mode: SetpointMode::from_bit(i == 1),
                    control_mode,
                    stroke_limit_bypass: i == 2,
                    setpoint: (i as i32 - 2) * 123_457 + j as i32,
                    ..ControlRegisters::default()
                };

                let status = StatusRegisters::decode(&regs.encode());
                assert_eq!(status.drive_enabled, regs.drive_enabled);
                assert_eq!(status.operation_enabled, regs.operation_enabled);
                assert_eq!(status.fct_blocked, regs.fct_blocked);
                assert_eq!(status.operation_mode, regs.operation_mode);
                assert_eq!(status.halt_active, regs.halt_active);
                assert_eq!(status.setpoint_mode, regs.setpoint_mode);
                assert_eq!(status.control_mode, regs.control_mode);
                assert_eq!(status.stroke_limit_reached, regs.stroke_limit_bypass);
                assert_eq!(status.position, regs.setpoint);
                // Brake release shares the warning bit position
                assert_eq!(status.warning_present, !regs.brake_active);

                assert_eq!(ControlRegisters::decode(&regs.encode()), regs);
            }
        }
    }

    #[test]
    fn test_safed_clears_motion_bits() {
        let running = ControlRegisters {
            drive_enabled: true,
            operation_enabled: true,
            brake_active: false,
            halt_active: false,
            positioning_start: true,
            operation_mode: OpMode::DirectApp,
            setpoint: 42,
            ..ControlRegisters::default()
        };
        let safe = running.safed();
        assert!(!safe.drive_enabled && !safe.operation_enabled);
        assert!(safe.halt_active && safe.brake_active && safe.reset);
        assert!(!safe.positioning_start);
        assert_eq!(safe.operation_mode, OpMode::DirectApp);
        assert_eq!(safe.setpoint, 42);
    }
}
