//! Configuration: positional command-line arguments for the per-test
//! quantities, a TOML side file for the per-testbed ones.
//!
//! The positional layout follows the underlying throughput tool, with the
//! PDV frame timeout appended: stateless tests read it at position 7,
//! stateful tests at position 12 after the five stateful parameters. The
//! side file carries what rarely changes between runs: MACs, addresses,
//! destination network counts, variator modes, port ranges, CPU cores and
//! the schedule tolerance.

use crate::variator::{IndexMode, VarMode};
use crate::{IpV4Addr, IpV6Addr, MacAddr, TestError, DEFAULT_TOLERANCE};

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command line of the PDV tester.
#[derive(Parser, Debug)]
#[command(name = "natperf-pdv", version, about = "RFC 8219 PDV tester for NAT44/NAT64 gateways")]
pub struct Cli {
    /// IPv6 frame size in bytes, Ethernet CRC included
    pub ipv6_frame_size: u16,
    /// IPv4 frame size in bytes, Ethernet CRC included
    pub ipv4_frame_size: u16,
    /// Frame rate per active sender, frames/s
    pub frame_rate: u32,
    /// Test duration in seconds
    pub duration: u16,
    /// Global timeout in milliseconds: how long receivers keep listening
    /// after the senders should have finished
    pub global_timeout: u16,
    /// Foreground ratio m/n (out of every n frames the first m are
    /// foreground), e.g. 1/1
    pub fg_ratio: String,
    /// Stateless: <frame_timeout>. Stateful: <stateful> <pre_rate>
    /// <pre_frames> <state_table_size> <responder_ports> <frame_timeout>.
    /// frame_timeout is in ms; 0 means a true PDV measurement
    #[arg(num_args = 1..=6)]
    pub rest: Vec<u64>,
    /// Testbed configuration file
    #[arg(short, long, default_value = "natperf.toml")]
    pub config: PathBuf,
}

/// One side of the testbed, as read from the side file.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct SideFile {
    /// Foreground IP version of frames this side sends: 4 or 6
    #[serde(default = "default_ip_version")]
    pub ip_version: u8,
    pub mac_tester: String,
    pub mac_dut: String,
    /// Foreground IPv4 address of this side
    pub ipv4: std::net::Ipv4Addr,
    /// Foreground IPv6 address of this side; for NAT64 runs this is the
    /// mapped (virtual) address
    pub ipv6: std::net::Ipv6Addr,
    /// Real IPv6 address used by background traffic
    pub ipv6_background: std::net::Ipv6Addr,
    /// Destination networks behind this side, 1..=256
    #[serde(default = "default_num_nets")]
    pub num_nets: u16,
    #[serde(default)]
    pub cpu_sender: Option<usize>,
    #[serde(default)]
    pub cpu_receiver: Option<usize>,
}

fn default_ip_version() -> u8 {
    4
}

fn default_num_nets() -> u16 {
    1
}

/// RFC 4814 port variation settings.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct PortsFile {
    /// 0 fixed, 1 increasing, 2 decreasing, 3 pseudorandom
    pub var_sport: u8,
    pub var_dport: u8,
    pub sport_min: u16,
    pub sport_max: u16,
    pub dport_min: u16,
    pub dport_max: u16,
}

impl Default for PortsFile {
    fn default() -> PortsFile {
        // RFC 4814 section 4.5 recommended ranges
        PortsFile {
            var_sport: 0,
            var_dport: 0,
            sport_min: 1024,
            sport_max: 65535,
            dport_min: 1,
            dport_max: 49151,
        }
    }
}

/// Timing knobs that almost never change.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct TimingFile {
    /// Schedule-slip threshold, slightly above 1.0
    pub tolerance: f64,
    /// Delay between arming the workers and the first frame deadline
    pub start_delay_ms: u64,
}

impl Default for TimingFile {
    fn default() -> TimingFile {
        TimingFile {
            tolerance: DEFAULT_TOLERANCE,
            start_delay_ms: 100,
        }
    }
}

/// The whole testbed side file.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default = "default_true")]
    pub forward: bool,
    #[serde(default = "default_true")]
    pub reverse: bool,
    /// Enumerate the sport x dport grid in the preliminary phase so every
    /// preliminary frame installs a distinct NAT mapping
    #[serde(default)]
    pub enumerate_ports: bool,
    pub left: SideFile,
    pub right: SideFile,
    #[serde(default)]
    pub ports: PortsFile,
    #[serde(default)]
    pub timing: TimingFile,
}

fn default_true() -> bool {
    true
}

impl FileConfig {
    pub fn load(path: &std::path::Path) -> Result<FileConfig, TestError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| TestError::Config(format!("can't read {}: {e}", path.display())))?;
        toml::from_str(&text)
            .map_err(|e| TestError::Config(format!("{}: {e}", path.display())))
    }

    /// A self-contained testbed for loopback self tests: both sides on
    /// made-up locally administered MACs and benchmarking addresses.
    pub fn loopback() -> FileConfig {
        FileConfig {
            forward: true,
            reverse: true,
            enumerate_ports: false,
            left: SideFile {
                ip_version: 4,
                mac_tester: "02:00:00:00:00:01".into(),
                mac_dut: "02:00:00:00:00:02".into(),
                ipv4: std::net::Ipv4Addr::new(198, 18, 0, 2),
                ipv6: "2001:2::2".parse().unwrap(),
                ipv6_background: "2001:2:0:8000::2".parse().unwrap(),
                num_nets: 1,
                cpu_sender: None,
                cpu_receiver: None,
            },
            right: SideFile {
                ip_version: 4,
                mac_tester: "02:00:00:00:00:03".into(),
                mac_dut: "02:00:00:00:00:04".into(),
                ipv4: std::net::Ipv4Addr::new(198, 19, 0, 2),
                ipv6: "2001:2:0:1::2".parse().unwrap(),
                ipv6_background: "2001:2:0:8001::2".parse().unwrap(),
                num_nets: 1,
                cpu_sender: None,
                cpu_receiver: None,
            },
            ports: PortsFile::default(),
            timing: TimingFile::default(),
        }
    }
}

/// One side of the testbed, resolved to wire types.
#[derive(Clone, Copy, Debug)]
pub struct SideSetup {
    pub ip_version: u8,
    pub mac_tester: MacAddr,
    pub mac_dut: MacAddr,
    pub ipv4: IpV4Addr,
    pub ipv6: IpV6Addr,
    pub ipv6_background: IpV6Addr,
    pub num_nets: u16,
    pub cpu_sender: Option<usize>,
    pub cpu_receiver: Option<usize>,
}

/// Fully validated measurement configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub ipv6_frame_size: u16,
    pub ipv4_frame_size: u16,
    pub frame_rate: u32,
    pub duration: u16,
    pub global_timeout: u16,
    pub n: u32,
    pub m: u32,
    /// 0 stateless, 1 initiator on the left, 2 initiator on the right
    pub stateful: u8,
    pub pre_rate: u32,
    pub pre_frames: u64,
    pub state_table_size: usize,
    pub responder_ports: IndexMode,
    /// 0 = true PDV; >0 = throughput mode with this per-frame timeout (ms)
    pub frame_timeout: u16,
    pub forward: bool,
    pub reverse: bool,
    pub enumerate_ports: bool,
    pub var_sport: VarMode,
    pub var_dport: VarMode,
    pub sport_min: u16,
    pub sport_max: u16,
    pub dport_min: u16,
    pub dport_max: u16,
    pub left: SideSetup,
    pub right: SideSetup,
    pub tolerance: f64,
    pub start_delay_ms: u64,
}

/// Parse `aa:bb:cc:dd:ee:ff`.
pub fn parse_mac(s: &str) -> Result<MacAddr, TestError> {
    let mut bytes = [0_u8; 6];
    let mut count = 0;
    for part in s.split(':') {
        if count == 6 {
            count += 1; // too many groups
            break;
        }
        bytes[count] = u8::from_str_radix(part, 16)
            .map_err(|_| TestError::Config(format!("bad MAC address '{s}'")))?;
        count += 1;
    }
    if count != 6 {
        return Err(TestError::Config(format!("bad MAC address '{s}'")));
    }
    Ok(MacAddr::new(bytes))
}

fn parse_ratio(s: &str) -> Result<(u32, u32), TestError> {
    let err = || TestError::Config(format!("bad foreground ratio '{s}', expected m/n like 1/1"));
    let (m, n) = s.split_once('/').ok_or_else(err)?;
    let m: u32 = m.trim().parse().map_err(|_| err())?;
    let n: u32 = n.trim().parse().map_err(|_| err())?;
    if n == 0 || m > n {
        return Err(TestError::Config(format!(
            "foreground ratio {m}/{n} needs 0 < n and m <= n"
        )));
    }
    Ok((m, n))
}

fn resolve_side(side: &SideFile, which: &str) -> Result<SideSetup, TestError> {
    if side.ip_version != 4 && side.ip_version != 6 {
        return Err(TestError::Config(format!(
            "{which}: IP version must be 4 or 6"
        )));
    }
    if side.num_nets == 0 || side.num_nets > 256 {
        return Err(TestError::Config(format!(
            "{which}: number of destination networks must be in 1..=256"
        )));
    }
    Ok(SideSetup {
        ip_version: side.ip_version,
        mac_tester: parse_mac(&side.mac_tester)?,
        mac_dut: parse_mac(&side.mac_dut)?,
        ipv4: IpV4Addr::new(side.ipv4.octets()),
        ipv6: IpV6Addr::new(side.ipv6.octets()),
        ipv6_background: IpV6Addr::new(side.ipv6_background.octets()),
        num_nets: side.num_nets,
        cpu_sender: side.cpu_sender,
        cpu_receiver: side.cpu_receiver,
    })
}

impl Config {
    /// Merge and validate the command line and the side file.
    pub fn assemble(cli: &Cli, file: &FileConfig) -> Result<Config, TestError> {
        let (m, n) = parse_ratio(&cli.fg_ratio)?;

        if !(64..=1518).contains(&cli.ipv4_frame_size) {
            return Err(TestError::Config(
                "IPv4 frame size must be in 64..=1518".into(),
            ));
        }
        if !(84..=1518).contains(&cli.ipv6_frame_size) {
            return Err(TestError::Config(
                "IPv6 frame size must be in 84..=1518".into(),
            ));
        }
        if cli.frame_rate == 0 || cli.duration == 0 {
            return Err(TestError::Config(
                "frame rate and duration must be positive".into(),
            ));
        }
        if !file.forward && !file.reverse {
            return Err(TestError::Config(
                "at least one direction must be active".into(),
            ));
        }

        let (stateful, pre_rate, pre_frames, state_table_size, responder_ports, frame_timeout) =
            match cli.rest.as_slice() {
                [frame_timeout] => (0_u8, 0_u32, 0_u64, 1_usize, IndexMode::First, *frame_timeout),
                [stateful, pre_rate, pre_frames, state_table_size, responder_ports, frame_timeout] =>
                {
                    if !(1..=2).contains(stateful) {
                        return Err(TestError::Config(
                            "stateful must be 1 (initiator left) or 2 (initiator right)".into(),
                        ));
                    }
                    if *pre_rate == 0 || *pre_frames == 0 || *state_table_size == 0 {
                        return Err(TestError::Config(
                            "preliminary rate, frame count and state table size must be positive"
                                .into(),
                        ));
                    }
                    let responder_ports =
                        u8::try_from(*responder_ports)
                            .ok()
                            .and_then(IndexMode::from_u8)
                            .ok_or_else(|| {
                                TestError::Config("responder-ports must be 0..=3".into())
                            })?;
                    (
                        *stateful as u8,
                        *pre_rate as u32,
                        *pre_frames,
                        *state_table_size as usize,
                        responder_ports,
                        *frame_timeout,
                    )
                }
                _ => {
                    return Err(TestError::Config(
                        "expected <frame_timeout> (stateless) or <stateful> <pre_rate> \
                         <pre_frames> <state_table_size> <responder_ports> <frame_timeout>"
                            .into(),
                    ))
                }
            };

        let frame_timeout = u16::try_from(frame_timeout).map_err(|_| {
            TestError::Config(
                "Frame timeout must be less than 1000*duration+global timeout, \
                 (0 means PDV measurement)."
                    .into(),
            )
        })?;
        if frame_timeout as u32 >= 1000 * cli.duration as u32 + cli.global_timeout as u32 {
            return Err(TestError::Config(
                "Frame timeout must be less than 1000*duration+global timeout, \
                 (0 means PDV measurement)."
                    .into(),
            ));
        }

        let var_sport = VarMode::from_u8(file.ports.var_sport)
            .ok_or_else(|| TestError::Config("var_sport must be 0..=3".into()))?;
        let var_dport = VarMode::from_u8(file.ports.var_dport)
            .ok_or_else(|| TestError::Config("var_dport must be 0..=3".into()))?;
        if file.ports.sport_min > file.ports.sport_max
            || file.ports.dport_min > file.ports.dport_max
        {
            return Err(TestError::Config("port ranges must satisfy min <= max".into()));
        }
        if file.timing.tolerance <= 1.0 {
            return Err(TestError::Config("tolerance must be above 1.0".into()));
        }

        Ok(Config {
            ipv6_frame_size: cli.ipv6_frame_size,
            ipv4_frame_size: cli.ipv4_frame_size,
            frame_rate: cli.frame_rate,
            duration: cli.duration,
            global_timeout: cli.global_timeout,
            n,
            m,
            stateful,
            pre_rate,
            pre_frames,
            state_table_size,
            responder_ports,
            frame_timeout,
            forward: file.forward,
            reverse: file.reverse,
            enumerate_ports: file.enumerate_ports,
            var_sport,
            var_dport,
            sport_min: file.ports.sport_min,
            sport_max: file.ports.sport_max,
            dport_min: file.ports.dport_min,
            dport_max: file.ports.dport_max,
            left: resolve_side(&file.left, "left")?,
            right: resolve_side(&file.right, "right")?,
            tolerance: file.timing.tolerance,
            start_delay_ms: file.timing.start_delay_ms,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cli(rest: &[u64]) -> Cli {
        Cli {
            ipv6_frame_size: 84,
            ipv4_frame_size: 64,
            frame_rate: 1000,
            duration: 1,
            global_timeout: 50,
            fg_ratio: "1/1".into(),
            rest: rest.to_vec(),
            config: PathBuf::from("natperf.toml"),
        }
    }

    #[test]
    fn test_stateless_arguments() {
        let cfg = Config::assemble(&cli(&[0]), &FileConfig::loopback()).unwrap();
        assert_eq!(cfg.stateful, 0);
        assert_eq!(cfg.frame_timeout, 0);
        assert_eq!((cfg.m, cfg.n), (1, 1));
    }

    #[test]
    fn test_stateful_arguments() {
        let cfg = Config::assemble(&cli(&[1, 5000, 5000, 1000, 1, 0]), &FileConfig::loopback())
            .unwrap();
        assert_eq!(cfg.stateful, 1);
        assert_eq!(cfg.pre_rate, 5000);
        assert_eq!(cfg.state_table_size, 1000);
        assert_eq!(cfg.responder_ports, IndexMode::Increasing);
    }

    #[test]
    fn test_frame_timeout_bound() {
        // 1000*1 + 50 = 1050: the timeout must stay below it
        let err = Config::assemble(&cli(&[1050]), &FileConfig::loopback()).unwrap_err();
        assert!(matches!(err, TestError::Config(_)));
        assert!(Config::assemble(&cli(&[1049]), &FileConfig::loopback()).is_ok());
    }

    #[test]
    fn test_ratio_validation() {
        let mut c = cli(&[0]);
        c.fg_ratio = "3/2".into();
        assert!(Config::assemble(&c, &FileConfig::loopback()).is_err());
        c.fg_ratio = "1/2".into();
        let cfg = Config::assemble(&c, &FileConfig::loopback()).unwrap();
        assert_eq!((cfg.m, cfg.n), (1, 2));
    }

    #[test]
    fn test_mac_parsing() {
        assert_eq!(
            parse_mac("02:AF:ff:1a:E5:3c").unwrap(),
            MacAddr::new([0x02, 0xAF, 0xFF, 0x1A, 0xE5, 0x3C])
        );
        assert!(parse_mac("02:00:00:00:00").is_err());
        assert!(parse_mac("02:00:00:00:00:00:00").is_err());
        assert!(parse_mac("nonsense").is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let text = r#"
            forward = true
            reverse = false

            [left]
            mac_tester = "02:00:00:00:00:01"
            mac_dut = "02:00:00:00:00:02"
            ipv4 = "198.18.0.2"
            ipv6 = "2001:2::2"
            ipv6_background = "2001:2:0:8000::2"
            cpu_sender = 2
            cpu_receiver = 3

            [right]
            ip_version = 6
            mac_tester = "02:00:00:00:00:03"
            mac_dut = "02:00:00:00:00:04"
            ipv4 = "198.19.0.2"
            ipv6 = "2001:2:0:1::2"
            ipv6_background = "2001:2:0:8001::2"
            num_nets = 4

            [ports]
            var_sport = 3
            var_dport = 1
            sport_min = 1000
            sport_max = 2000
            dport_min = 3000
            dport_max = 4000
        "#;
        let file: FileConfig = toml::from_str(text).unwrap();
        let cfg = Config::assemble(&cli(&[0]), &file).unwrap();
        assert!(!cfg.reverse);
        assert_eq!(cfg.right.ip_version, 6);
        assert_eq!(cfg.right.num_nets, 4);
        assert_eq!(cfg.var_sport, VarMode::Random);
        assert_eq!(cfg.var_dport, VarMode::Increasing);
        assert_eq!(cfg.left.cpu_sender, Some(2));
        assert_eq!(cfg.left.ipv4, IpV4Addr::new([198, 18, 0, 2]));
    }
}
