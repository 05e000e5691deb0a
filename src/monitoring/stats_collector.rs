use std::collections::HashMap;

use parking_lot::Mutex;

use crate::{
    common::types::SessionId,
    gateway::constants::FRAME_DURATION,
    protocol::{Cpu, FrameStats, Memory, Stats},
    server::{AppState, Session},
};

/// Linux always reports `/proc/self/stat` times in 100 Hz ticks.
const USER_HZ: u64 = 100;

#[derive(Debug, Default, Clone, Copy)]
struct CpuSample {
    idle: u64,
    total: u64,
    process_ticks: u64,
    wall_ticks: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct FrameTotals {
    sent: u64,
    nulled: u64,
}

/// Samples process and player statistics. CPU loads and frame stats are
/// deltas against the previous sample.
pub struct StatsCollector {
    interval_secs: u64,
    cpu: Mutex<CpuSample>,
    frames: Mutex<HashMap<SessionId, FrameTotals>>,
}

impl StatsCollector {
    pub fn new(interval_secs: u64) -> Self {
        Self {
            interval_secs,
            cpu: Mutex::new(CpuSample::default()),
            frames: Mutex::new(HashMap::new()),
        }
    }

    /// Node-wide stats; frame stats are included for `session` only.
    pub fn collect(&self, state: &AppState, session: Option<&Session>) -> Stats {
        let mut players = 0;
        let mut playing_players = 0;
        for s in state.all_sessions() {
            for player in s.players() {
                players += 1;
                if player.is_playing() {
                    playing_players += 1;
                }
            }
        }

        let (used, total) = read_memory_stats();
        let cores = num_cpus();
        let (system_load, process_load) = self.sample_cpu();

        Stats {
            players,
            playing_players,
            uptime: state.start_time.elapsed().as_millis() as u64,
            memory: Memory {
                free: total.saturating_sub(used),
                used,
                allocated: used,
                reservable: total,
            },
            cpu: Cpu {
                cores,
                system_load,
                lavalink_load: (process_load / cores as f64).clamp(0.0, 1.0),
            },
            frame_stats: session.and_then(|s| self.frame_stats(s)),
        }
    }

    /// Averages the frames sent and nulled since the last call over the
    /// session's playing players. `None` on the first sample or with no playing player.
    fn frame_stats(&self, session: &Session) -> Option<FrameStats> {
        let mut current = FrameTotals::default();
        let mut playing = 0i64;
        for player in session.players() {
            let counters = player.counters().snapshot();
            current.sent += counters.transmitted;
            current.nulled += counters.nulled;
            if player.is_playing() {
                playing += 1;
            }
        }

        let previous = self
            .frames
            .lock()
            .insert(session.session_id.clone(), current)?;
        if playing == 0 {
            return None;
        }

        let sent = current.sent.saturating_sub(previous.sent) as i64;
        let nulled = current.nulled.saturating_sub(previous.nulled) as i64;
        Some(average_frame_stats(sent, nulled, playing, self.interval_secs))
    }

    /// Forgets the frame baseline of a session that ended.
    pub fn forget(&self, session_id: &SessionId) {
        self.frames.lock().remove(session_id);
    }

    fn sample_cpu(&self) -> (f64, f64) {
        let Some(next) = read_cpu_sample() else {
            return (0.0, 0.0);
        };
        let previous = std::mem::replace(&mut *self.cpu.lock(), next);
        if previous.total == 0 {
            return (0.0, 0.0);
        }
        cpu_loads(previous, next)
    }
}

fn average_frame_stats(sent: i64, nulled: i64, players: i64, interval_secs: u64) -> FrameStats {
    let frames_per_sec = 1000 / FRAME_DURATION.as_millis() as i64;
    let expected = interval_secs as i64 * frames_per_sec * players;
    FrameStats {
        sent: sent / players,
        nulled: nulled / players,
        deficit: (expected - (sent + nulled)) / players,
    }
}

fn cpu_loads(previous: CpuSample, next: CpuSample) -> (f64, f64) {
    let d_total = next.total.saturating_sub(previous.total);
    let d_idle = next.idle.saturating_sub(previous.idle);
    let system = if d_total == 0 {
        0.0
    } else {
        d_total.saturating_sub(d_idle) as f64 / d_total as f64
    };

    let d_wall = next.wall_ticks.saturating_sub(previous.wall_ticks);
    let d_process = next.process_ticks.saturating_sub(previous.process_ticks);
    let process = if d_wall == 0 {
        0.0
    } else {
        d_process as f64 / d_wall as f64
    };
    (system, process)
}

fn read_cpu_sample() -> Option<CpuSample> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    let (idle, total) = parse_proc_stat(&stat)?;

    let own = std::fs::read_to_string("/proc/self/stat").ok()?;
    let process_ticks = parse_process_ticks(&own)?;

    let uptime: f64 = std::fs::read_to_string("/proc/uptime")
        .ok()
        .and_then(|s| s.split_whitespace().next().and_then(|v| v.parse().ok()))?;

    Some(CpuSample {
        idle,
        total,
        process_ticks,
        wall_ticks: (uptime * USER_HZ as f64) as u64,
    })
}

/// Idle and total jiffies of the aggregate `cpu` line.
fn parse_proc_stat(stat: &str) -> Option<(u64, u64)> {
    let mut fields = stat.lines().next()?.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let values: Vec<u64> = fields.filter_map(|v| v.parse().ok()).collect();
    let idle = *values.get(3)?;
    Some((idle, values.iter().sum()))
}

/// utime + stime of `/proc/self/stat`. The command name may contain spaces,
/// so fields are counted from the closing parenthesis.
fn parse_process_ticks(stat: &str) -> Option<u64> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

fn num_cpus() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

/// Resident set size and total memory in bytes.
fn read_memory_stats() -> (u64, u64) {
    let used = std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|s| kib_field(&s, "VmRSS:"))
        .unwrap_or(0);
    let total = std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|s| kib_field(&s, "MemTotal:"))
        .unwrap_or(0);
    (used, total)
}

fn kib_field(text: &str, key: &str) -> Option<u64> {
    text.lines()
        .find(|l| l.starts_with(key))?
        .split_whitespace()
        .nth(1)?
        .parse::<u64>()
        .ok()
        .map(|kib| kib * 1024)
}
