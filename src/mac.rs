//! Best-effort peer MAC lookup from the kernel neighbour table

use cached::proc_macro::cached;
use std::net::IpAddr;
use tracing::debug;

const ARP_TABLE: &str = "/proc/net/arp";

/// Resolve the hardware address of a peer, if it is on a directly attached
/// network. Cached for 60 seconds.
#[cached(time = 60, key = "IpAddr", convert = r#"{ ip }"#)]
pub async fn resolve(ip: IpAddr) -> Option<String> {
    // The neighbour table only lists IPv4 peers
    let IpAddr::V4(v4) = ip else {
        return None;
    };

    match tokio::fs::read_to_string(ARP_TABLE).await {
        Ok(table) => lookup(&table, &v4.to_string()),
        Err(e) => {
            debug!("Cannot read {}: {}", ARP_TABLE, e);
            None
        }
    }
}

/// Find `ip` in the text of `/proc/net/arp`.
///
/// ```text
/// IP address       HW type     Flags       HW address            Mask     Device
/// 192.168.1.1      0x1         0x2         52:54:00:12:34:56     *        eth0
/// ```
fn lookup(table: &str, ip: &str) -> Option<String> {
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[0] != ip {
            return None;
        }
        let hw = fields[3];
        if hw == "00:00:00:00:00:00" {
            return None;
        }
        Some(hw.to_string())
    })
}
