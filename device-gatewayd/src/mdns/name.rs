use thiserror::Error;

/// Identity carried in an advertised instance name such as
/// `dock-door-3 [00:11:22:33:44:55]._workstation._tcp.local.`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedName {
    pub name: String,
    pub hardware_id: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed advertised name {raw:?}: {reason}")]
pub struct MalformedName {
    pub raw: String,
    pub reason: &'static str,
}

impl AdvertisedName {
    /// Parse `"<name> [<hardware_id>]"`, with or without the trailing
    /// `.<service_type>`.
    pub fn parse(raw: &str, service_type: &str) -> Result<Self, MalformedName> {
        let malformed = |reason| MalformedName {
            raw: raw.to_string(),
            reason,
        };

        let instance = raw
            .strip_suffix(service_type)
            .and_then(|s| s.strip_suffix('.'))
            .unwrap_or(raw)
            .trim_end();

        let inner = instance
            .strip_suffix(']')
            .ok_or_else(|| malformed("missing [hardware id]"))?;
        let open = inner
            .rfind('[')
            .ok_or_else(|| malformed("missing [hardware id]"))?;

        let name = inner[..open].trim();
        let hardware_id = inner[open + 1..].trim();

        if name.is_empty() {
            return Err(malformed("empty device name"));
        }
        if hardware_id.is_empty() {
            return Err(malformed("empty hardware id"));
        }

        Ok(Self {
            name: name.to_string(),
            hardware_id: hardware_id.to_string(),
        })
    }
}
