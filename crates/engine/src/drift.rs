//! Clock-drift probing against NTP.
//!
//! The probe is a pure pipeline — query, classify, emit — parameterized by
//! the [`NtpTransport`] seam so tests inject scripted samples. The engine's
//! bus subscription performs the actual `clock_drift` halt when a
//! `time_drift_halt` event is observed; the probe itself never touches risk
//! state.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::net::UdpSocket;
use tracing::{error, info, warn};

use pm_arb_core::{
    CoreError, CycleContext, EngineEvent, EventBus, NtpConfig, NtpSample, NtpTransport,
};

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_EPOCH_DELTA: i64 = 2_208_988_800;

// =============================================================================
// Classification
// =============================================================================

/// Drift bands from the absolute offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftSeverity {
    /// Below 100 ms: log only.
    Nominal,
    /// 100–499 ms.
    Warning,
    /// 500–999 ms.
    Critical,
    /// 1000 ms or more: trading must halt.
    Halt,
}

/// Classifies an offset into its severity band.
#[must_use]
pub fn classify_drift(offset_ms: i64) -> DriftSeverity {
    match offset_ms.abs() {
        0..=99 => DriftSeverity::Nominal,
        100..=499 => DriftSeverity::Warning,
        500..=999 => DriftSeverity::Critical,
        _ => DriftSeverity::Halt,
    }
}

/// One completed probe: offset, answering server, and severity.
#[derive(Debug, Clone)]
pub struct DriftReading {
    /// Measured offset in milliseconds.
    pub offset_ms: i64,
    /// Server that answered.
    pub server: String,
    /// Severity band.
    pub severity: DriftSeverity,
}

// =============================================================================
// SNTP Wire Helpers
// =============================================================================

fn be_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Reads one 64-bit NTP timestamp (seconds since 1900 + 32-bit fraction)
/// into Unix milliseconds.
fn ntp_timestamp_ms(buf: &[u8], at: usize) -> i64 {
    let secs = i64::from(be_u32(buf, at)) - NTP_UNIX_EPOCH_DELTA;
    let frac_ms = (i64::from(be_u32(buf, at + 4)) * 1000) >> 32;
    secs * 1000 + frac_ms
}

/// Standard NTP offset estimate from the four timestamps.
fn offset_ms(t1: i64, t2: i64, t3: i64, t4: i64) -> i64 {
    ((t2 - t1) + (t3 - t4)) / 2
}

// =============================================================================
// UDP Transport
// =============================================================================

/// Minimal SNTP client over UDP (48-byte v3 exchange).
#[derive(Debug, Clone)]
pub struct UdpNtpTransport {
    timeout: std::time::Duration,
}

impl UdpNtpTransport {
    /// Creates a transport with the given per-query timeout.
    #[must_use]
    pub fn new(timeout: std::time::Duration) -> Self {
        Self { timeout }
    }
}

impl Default for UdpNtpTransport {
    fn default() -> Self {
        Self::new(std::time::Duration::from_secs(5))
    }
}

#[async_trait]
impl NtpTransport for UdpNtpTransport {
    async fn query(&self, server: &str) -> pm_arb_core::Result<NtpSample> {
        let addr = if server.contains(':') {
            server.to_string()
        } else {
            format!("{server}:123")
        };

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| CoreError::SystemHealth(format!("ntp socket: {e}")))?;
        socket
            .connect(&addr)
            .await
            .map_err(|e| CoreError::SystemHealth(format!("ntp connect {addr}: {e}")))?;

        // LI = 0, VN = 3, Mode = 3 (client).
        let mut packet = [0u8; 48];
        packet[0] = 0x1B;

        let t1 = Utc::now();
        socket
            .send(&packet)
            .await
            .map_err(|e| CoreError::SystemHealth(format!("ntp send: {e}")))?;

        let mut response = [0u8; 48];
        let received = tokio::time::timeout(self.timeout, socket.recv(&mut response))
            .await
            .map_err(|_| CoreError::Timeout {
                operation: format!("ntp query {server}"),
            })?
            .map_err(|e| CoreError::SystemHealth(format!("ntp recv: {e}")))?;
        let t4 = Utc::now();

        if received < 48 {
            return Err(CoreError::SystemHealth(format!(
                "short NTP response from {server}: {received} bytes"
            )));
        }

        let t2 = ntp_timestamp_ms(&response, 32);
        let t3 = ntp_timestamp_ms(&response, 40);
        // Offset is server-minus-local: negate so positive means the local
        // clock runs fast.
        let offset = -offset_ms(t1.timestamp_millis(), t2, t3, t4.timestamp_millis());

        Ok(NtpSample {
            offset_ms: offset,
            server: server.to_string(),
            measured_at: t4,
        })
    }
}

// =============================================================================
// Drift Probe
// =============================================================================

/// Runs the retry/fallback sequence and publishes classification events.
pub struct DriftProbe {
    transport: Arc<dyn NtpTransport>,
    config: NtpConfig,
    bus: EventBus,
}

impl std::fmt::Debug for DriftProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriftProbe")
            .field("config", &self.config)
            .finish()
    }
}

impl DriftProbe {
    /// Creates a probe.
    #[must_use]
    pub fn new(transport: Arc<dyn NtpTransport>, config: NtpConfig, bus: EventBus) -> Self {
        Self {
            transport,
            config,
            bus,
        }
    }

    /// Queries the primary server with retries, then the fallback.
    ///
    /// # Errors
    /// Returns [`CoreError::SystemHealth`] once both servers are exhausted.
    pub async fn probe(&self, ctx: &CycleContext) -> pm_arb_core::Result<NtpSample> {
        let attempts = self.config.attempts.max(1);
        for server in [&self.config.primary, &self.config.fallback] {
            for attempt in 1..=attempts {
                match self.transport.query(server).await {
                    Ok(sample) => return Ok(sample),
                    Err(e) => {
                        warn!(
                            correlation_id = %ctx.correlation_id,
                            server = %server,
                            attempt,
                            error = %e,
                            "NTP query failed"
                        );
                        if attempt < attempts {
                            tokio::time::sleep(std::time::Duration::from_millis(
                                self.config.retry_delay_ms,
                            ))
                            .await;
                        }
                    }
                }
            }
        }
        Err(CoreError::SystemHealth(
            "all NTP servers exhausted".to_string(),
        ))
    }

    /// Runs one probe and publishes the classification event.
    ///
    /// Both servers failing raises an error in the log but never halts
    /// trading; `None` is returned.
    pub async fn run_once(&self, ctx: &CycleContext) -> Option<DriftReading> {
        let sample = match self.probe(ctx).await {
            Ok(sample) => sample,
            Err(e) => {
                error!(
                    correlation_id = %ctx.correlation_id,
                    error = %e,
                    "Drift probe exhausted all servers"
                );
                return None;
            }
        };

        let severity = classify_drift(sample.offset_ms);
        match severity {
            DriftSeverity::Nominal => {
                info!(
                    correlation_id = %ctx.correlation_id,
                    drift_ms = sample.offset_ms,
                    server = %sample.server,
                    "Clock drift nominal"
                );
            }
            DriftSeverity::Warning => {
                self.bus.publish(
                    ctx,
                    EngineEvent::TimeDriftWarning {
                        drift_ms: sample.offset_ms,
                        server: sample.server.clone(),
                    },
                );
            }
            DriftSeverity::Critical => {
                self.bus.publish(
                    ctx,
                    EngineEvent::TimeDriftCritical {
                        drift_ms: sample.offset_ms,
                        server: sample.server.clone(),
                    },
                );
            }
            DriftSeverity::Halt => {
                warn!(
                    correlation_id = %ctx.correlation_id,
                    drift_ms = sample.offset_ms,
                    server = %sample.server,
                    "Clock drift at halt threshold"
                );
                self.bus.publish(
                    ctx,
                    EngineEvent::TimeDriftHalt {
                        drift_ms: sample.offset_ms,
                        server: sample.server.clone(),
                    },
                );
            }
        }

        Some(DriftReading {
            offset_ms: sample.offset_ms,
            server: sample.server,
            severity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    // ==================== Classification Tests ====================

    #[test]
    fn test_classification_bands() {
        assert_eq!(classify_drift(0), DriftSeverity::Nominal);
        assert_eq!(classify_drift(99), DriftSeverity::Nominal);
        assert_eq!(classify_drift(100), DriftSeverity::Warning);
        assert_eq!(classify_drift(499), DriftSeverity::Warning);
        assert_eq!(classify_drift(500), DriftSeverity::Critical);
        assert_eq!(classify_drift(999), DriftSeverity::Critical);
        assert_eq!(classify_drift(1000), DriftSeverity::Halt);
        assert_eq!(classify_drift(25_000), DriftSeverity::Halt);
    }

    #[test]
    fn test_classification_uses_absolute_value() {
        assert_eq!(classify_drift(-250), DriftSeverity::Warning);
        assert_eq!(classify_drift(-1500), DriftSeverity::Halt);
    }

    // ==================== Wire Format Tests ====================

    #[test]
    fn test_ntp_timestamp_parsing() {
        let mut buf = [0u8; 48];
        // 1900 + NTP_UNIX_EPOCH_DELTA seconds = Unix epoch.
        buf[32..36].copy_from_slice(&(NTP_UNIX_EPOCH_DELTA as u32).to_be_bytes());
        // Fraction 0x8000_0000 = 500 ms.
        buf[36..40].copy_from_slice(&0x8000_0000u32.to_be_bytes());
        assert_eq!(ntp_timestamp_ms(&buf, 32), 500);
    }

    #[test]
    fn test_offset_formula() {
        // Server timestamps 100 ms ahead of a symmetric path.
        assert_eq!(offset_ms(0, 150, 160, 60), 125);
        assert_eq!(offset_ms(0, 50, 60, 110), 0);
    }

    // ==================== Scripted Transport ====================

    struct ScriptedTransport {
        responses: Mutex<VecDeque<pm_arb_core::Result<i64>>>,
        queried: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<pm_arb_core::Result<i64>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                queried: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl NtpTransport for ScriptedTransport {
        async fn query(&self, server: &str) -> pm_arb_core::Result<NtpSample> {
            self.queried.lock().push(server.to_string());
            match self.responses.lock().pop_front() {
                Some(Ok(offset_ms)) => Ok(NtpSample {
                    offset_ms,
                    server: server.to_string(),
                    measured_at: Utc::now(),
                }),
                Some(Err(e)) => Err(e),
                None => Err(CoreError::SystemHealth("script exhausted".to_string())),
            }
        }
    }

    fn config() -> NtpConfig {
        NtpConfig {
            primary: "primary.test".to_string(),
            fallback: "fallback.test".to_string(),
            attempts: 3,
            retry_delay_ms: 1,
        }
    }

    fn unreachable() -> pm_arb_core::Result<i64> {
        Err(CoreError::Timeout {
            operation: "ntp".to_string(),
        })
    }

    // ==================== Probe Tests ====================

    #[tokio::test]
    async fn test_probe_first_attempt_succeeds() {
        let transport = ScriptedTransport::new(vec![Ok(42)]);
        let probe = DriftProbe::new(transport.clone(), config(), EventBus::default());

        let sample = probe.probe(&CycleContext::new()).await.unwrap();
        assert_eq!(sample.offset_ms, 42);
        assert_eq!(transport.queried.lock().as_slice(), ["primary.test"]);
    }

    #[tokio::test]
    async fn test_probe_retries_then_falls_back() {
        let transport = ScriptedTransport::new(vec![
            unreachable(),
            unreachable(),
            unreachable(),
            Ok(10),
        ]);
        let probe = DriftProbe::new(transport.clone(), config(), EventBus::default());

        let sample = probe.probe(&CycleContext::new()).await.unwrap();
        assert_eq!(sample.server, "fallback.test");
        assert_eq!(
            transport.queried.lock().as_slice(),
            ["primary.test", "primary.test", "primary.test", "fallback.test"]
        );
    }

    #[tokio::test]
    async fn test_probe_exhausted_raises_error() {
        let transport = ScriptedTransport::new(vec![
            unreachable(),
            unreachable(),
            unreachable(),
            unreachable(),
            unreachable(),
            unreachable(),
        ]);
        let probe = DriftProbe::new(transport.clone(), config(), EventBus::default());

        assert!(probe.probe(&CycleContext::new()).await.is_err());
        assert_eq!(transport.queried.lock().len(), 6);
    }

    // ==================== Event Emission Tests ====================

    async fn run_once_with_offset(offset: i64) -> (Option<DriftReading>, Vec<&'static str>) {
        let transport = ScriptedTransport::new(vec![Ok(offset)]);
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let probe = DriftProbe::new(transport, config(), bus);

        let reading = probe.run_once(&CycleContext::new()).await;
        let mut names = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            names.push(envelope.event.name());
        }
        (reading, names)
    }

    #[tokio::test]
    async fn test_nominal_drift_emits_nothing() {
        let (reading, names) = run_once_with_offset(50).await;
        assert_eq!(reading.unwrap().severity, DriftSeverity::Nominal);
        assert!(names.is_empty());
    }

    #[tokio::test]
    async fn test_warning_band_emits_warning() {
        let (reading, names) = run_once_with_offset(250).await;
        assert_eq!(reading.unwrap().severity, DriftSeverity::Warning);
        assert_eq!(names, ["time_drift_warning"]);
    }

    #[tokio::test]
    async fn test_critical_band_emits_critical() {
        let (reading, names) = run_once_with_offset(750).await;
        assert_eq!(reading.unwrap().severity, DriftSeverity::Critical);
        assert_eq!(names, ["time_drift_critical"]);
    }

    #[tokio::test]
    async fn test_halt_band_emits_halt() {
        let (reading, names) = run_once_with_offset(1200).await;
        assert_eq!(reading.unwrap().severity, DriftSeverity::Halt);
        assert_eq!(names, ["time_drift_halt"]);
    }

    #[tokio::test]
    async fn test_exhausted_probe_does_not_emit() {
        let transport = ScriptedTransport::new(vec![]);
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let mut cfg = config();
        cfg.attempts = 1;
        let probe = DriftProbe::new(transport, cfg, bus);

        assert!(probe.run_once(&CycleContext::new()).await.is_none());
        assert!(rx.try_recv().is_err());
    }
}
