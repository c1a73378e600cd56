//! Network identity: MAC generation and DHCP lease lookup.

use crate::error::{Result, VmError};
use crate::virsh::Virsh;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Locally administered prefix QEMU/KVM uses for guest NICs.
pub const MAC_PREFIX: [u8; 3] = [0x52, 0x54, 0x00];

/// Default interval between lease lookups.
pub const DEFAULT_LEASE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A 48-bit Ethernet hardware address, rendered as lowercase `aa:bb:cc:dd:ee:ff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Generate a guest MAC under [`MAC_PREFIX`].
    ///
    /// The fourth octet stays below `0x80`; the last two span the full byte.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self([
            MAC_PREFIX[0],
            MAC_PREFIX[1],
            MAC_PREFIX[2],
            rng.random_range(0x00..=0x7f),
            rng.random(),
            rng.random(),
        ])
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn has_guest_prefix(&self) -> bool {
        self.0[..3] == MAC_PREFIX
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || VmError::Configuration(format!("invalid MAC address: {s}"));
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = VmError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}

/// Find the address leased to `mac` in `virsh net-dhcp-leases` output.
///
/// The table is tokenized on whitespace; the address sits two tokens after
/// the MAC (MAC, protocol, address/prefix). The prefix length is dropped.
pub fn parse_lease_address(leases: &str, mac: &MacAddress) -> Option<String> {
    let wanted = mac.to_string();
    let tokens: Vec<&str> = leases.split_whitespace().collect();
    let index = tokens
        .iter()
        .position(|token| token.eq_ignore_ascii_case(&wanted))?;
    let with_prefix = tokens.get(index + 2)?;
    with_prefix
        .split('/')
        .next()
        .filter(|addr| !addr.is_empty())
        .map(str::to_string)
}

/// Look up the current lease for `mac` on `network`.
///
/// `Ok(None)` means the guest has not leased an address yet.
pub async fn resolve_address(
    virsh: &Virsh,
    network: &str,
    mac: &MacAddress,
) -> Result<Option<String>> {
    let leases = virsh.dhcp_leases(network).await?;
    Ok(parse_lease_address(&leases, mac))
}

/// How long and how often [`wait_for_address`] polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseWait {
    /// Delay between lookups.
    pub interval: Duration,
    /// Give up after this long. `None` waits until cancelled.
    pub timeout: Option<Duration>,
}

impl Default for LeaseWait {
    fn default() -> Self {
        Self {
            interval: DEFAULT_LEASE_POLL_INTERVAL,
            timeout: None,
        }
    }
}

/// Poll the lease table until `mac` has an address.
///
/// Lookup failures abort the wait; an absent lease is retried every
/// `policy.interval`. Returns [`VmError::Cancelled`] as soon as `cancel`
/// fires and [`VmError::Timeout`] once `policy.timeout` has elapsed.
pub async fn wait_for_address(
    virsh: &Virsh,
    network: &str,
    mac: &MacAddress,
    policy: LeaseWait,
    cancel: &CancellationToken,
) -> Result<String> {
    let start = Instant::now();
    let deadline = policy.timeout.map(|t| start + t);
    tracing::info!(%network, %mac, "Waiting for IP address to appear in DHCP leases");

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        if let Some(address) = resolve_address(virsh, network, mac).await? {
            tracing::info!(
                %network,
                %address,
                attempts,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "DHCP lease found"
            );
            return Ok(address);
        }

        if let (Some(deadline), Some(timeout)) = (deadline, policy.timeout) {
            if Instant::now() >= deadline {
                tracing::warn!(%network, %mac, attempts, "Timed out waiting for DHCP lease");
                return Err(VmError::Timeout(timeout));
            }
        }

        tracing::trace!(%network, attempt = attempts, "No lease yet, retrying...");
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::info!(%network, attempts, "Lease wait cancelled");
                return Err(VmError::Cancelled);
            }

            _ = tokio::time::sleep(policy.interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ScriptedRunner;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    const LEASES: &str = " Expiry Time           MAC address         Protocol   IP address           Hostname   Client ID or DUID
-------------------------------------------------------------------------------------------------------------------
 2026-10-16 12:00:00   52:54:00:12:34:56   ipv4       192.168.122.45/24    web        -
 2026-10-16 12:01:00   52:54:00:65:43:21   ipv4       192.168.122.46/24    db         -
";

    fn mac(s: &str) -> MacAddress {
        s.parse().unwrap()
    }

    #[test]
    fn test_generated_macs_keep_prefix() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..256 {
            let mac = MacAddress::generate(&mut rng);
            assert!(mac.has_guest_prefix());
            assert!(mac.octets()[3] <= 0x7f);
            assert!(mac.to_string().starts_with("52:54:00:"));
        }
    }

    #[test]
    fn test_seeded_generation_is_deterministic() {
        let a = MacAddress::generate(&mut StdRng::seed_from_u64(42));
        let b = MacAddress::generate(&mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn test_mac_parse_and_display() {
        let parsed = mac("52:54:00:0A:bC:ff");
        assert_eq!(parsed.to_string(), "52:54:00:0a:bc:ff");
        assert_eq!(parsed, MacAddress::new([0x52, 0x54, 0x00, 0x0a, 0xbc, 0xff]));
        assert!("52:54:00:0a:bc".parse::<MacAddress>().is_err());
        assert!("52:54:00:0a:bc:ff:00".parse::<MacAddress>().is_err());
        assert!("52:54:00:0a:bc:zz".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_mac_serde_as_string() {
        let json = serde_json::to_string(&mac("52:54:00:01:02:03")).unwrap();
        assert_eq!(json, "\"52:54:00:01:02:03\"");
        let back: MacAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mac("52:54:00:01:02:03"));
    }

    #[test]
    fn test_parse_lease_strips_prefix() {
        assert_eq!(
            parse_lease_address(LEASES, &mac("52:54:00:65:43:21")),
            Some("192.168.122.46".to_string())
        );
    }

    #[test]
    fn test_parse_lease_absent() {
        assert_eq!(parse_lease_address(LEASES, &mac("52:54:00:00:00:01")), None);
        assert_eq!(parse_lease_address("", &mac("52:54:00:00:00:01")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_polls_until_lease_appears() {
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .respond("net-dhcp-leases", "")
            .respond("net-dhcp-leases", "")
            .respond("net-dhcp-leases", LEASES);
        let virsh = Virsh::new(runner.clone(), "qemu:///system");

        let address = wait_for_address(
            &virsh,
            "default",
            &mac("52:54:00:12:34:56"),
            LeaseWait::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(address, "192.168.122.45");
        assert_eq!(runner.count("net-dhcp-leases --network default"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let runner = Arc::new(ScriptedRunner::new());
        let virsh = Virsh::new(runner.clone(), "qemu:///system");
        let policy = LeaseWait {
            interval: Duration::from_secs(1),
            timeout: Some(Duration::from_secs(3)),
        };

        let err = wait_for_address(
            &virsh,
            "default",
            &mac("52:54:00:12:34:56"),
            policy,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, VmError::Timeout(t) if t == Duration::from_secs(3)));
        assert_eq!(runner.count("net-dhcp-leases"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_honours_cancellation() {
        let runner = Arc::new(ScriptedRunner::new());
        let virsh = Virsh::new(runner.clone(), "qemu:///system");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = wait_for_address(
            &virsh,
            "default",
            &mac("52:54:00:12:34:56"),
            LeaseWait::default(),
            &cancel,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, VmError::Cancelled));
        assert_eq!(runner.count("net-dhcp-leases"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_stops_promptly_when_cancelled_mid_poll() {
        let runner = Arc::new(ScriptedRunner::new());
        let virsh = Virsh::new(runner.clone(), "qemu:///system");
        let cancel = CancellationToken::new();

        let wait = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                wait_for_address(
                    &virsh,
                    "default",
                    &mac("52:54:00:12:34:56"),
                    LeaseWait::default(),
                    &cancel,
                )
                .await
            }
        });

        // Several 1s intervals pass with no lease in the table.
        tokio::time::sleep(Duration::from_millis(3500)).await;
        cancel.cancel();
        let cancelled_at = Instant::now();

        let err = wait.await.unwrap().unwrap_err();

        assert!(matches!(err, VmError::Cancelled));
        assert!(cancelled_at.elapsed() < Duration::from_secs(1));
        assert!(runner.count("net-dhcp-leases") > 1);
    }

    #[tokio::test]
    async fn test_lookup_failure_aborts_wait() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("net-dhcp-leases", "network 'nope' not found");
        let virsh = Virsh::new(runner, "qemu:///system");

        let err = wait_for_address(
            &virsh,
            "nope",
            &mac("52:54:00:12:34:56"),
            LeaseWait::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, VmError::ExternalTool { .. }));
    }
}
