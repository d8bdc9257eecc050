use crate::types::ServiceKey;

/// Maximum length of a generated backend group name (cloud resource name limit)
pub const MAX_NAME_LEN: usize = 63;

/// Prefix used by [`PrefixNamer::default`]
pub const DEFAULT_PREFIX: &str = "k8s1";

/// Naming capability for backend groups.
///
/// Implementations must be pure functions of their inputs: every feature in the
/// process builds names through one injected namer, which is what lets merge
/// assume duplicate keys always carry identical names.
pub trait BackendNamer: Send + Sync {
    /// Name for a plain service port
    fn name(&self, service: &ServiceKey, service_port: i32) -> String;

    /// Name for a subset-qualified service port
    fn name_with_subset(&self, service: &ServiceKey, service_port: i32, subset: &str) -> String;

    /// Whether `name` could have been produced by this namer
    fn is_generated(&self, name: &str) -> bool;
}

/// Length of the hash suffix closing every generated name
pub const HASH_LEN: usize = 8;

/// Namer producing `<prefix>-<namespace>-<name>[-<subset>]-<port>-<hash>`
///
/// Components are lowercased and characters outside `[a-z0-9-]` become
/// hyphens. When the result would exceed [`MAX_NAME_LEN`] the namespace, name
/// and subset are shortened evenly. The trailing hash covers the full
/// untruncated identity, so distinct inputs keep distinct names.
#[derive(Debug, Clone)]
pub struct PrefixNamer {
    prefix: String,
}

impl PrefixNamer {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: sanitize(&prefix.into()),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn compose(&self, fields: Vec<String>, port: i32, hash: u32) -> String {
        let port = port.to_string();
        let mut fields: Vec<String> = fields.iter().map(|f| sanitize(f)).collect();
        // One separator before every field, the port and the hash
        let fixed = self.prefix.len() + fields.len() + 1 + port.len() + 1 + HASH_LEN;
        trim_evenly(&mut fields, MAX_NAME_LEN.saturating_sub(fixed));

        let mut name = self.prefix.clone();
        for field in &fields {
            name.push('-');
            name.push_str(field);
        }
        let mut name = format!("{}-{}-{:08x}", name, port, hash);
        name.truncate(MAX_NAME_LEN);
        name
    }
}

impl Default for PrefixNamer {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl BackendNamer for PrefixNamer {
    fn name(&self, service: &ServiceKey, service_port: i32) -> String {
        let hash = crc32fast::hash(
            format!("{}/{}/{}", service.namespace, service.name, service_port).as_bytes(),
        );
        self.compose(
            vec![service.namespace.clone(), service.name.clone()],
            service_port,
            hash,
        )
    }

    fn name_with_subset(&self, service: &ServiceKey, service_port: i32, subset: &str) -> String {
        let hash = crc32fast::hash(
            format!(
                "{}/{}/{}/{}",
                service.namespace, service.name, service_port, subset
            )
            .as_bytes(),
        );
        self.compose(
            vec![
                service.namespace.clone(),
                service.name.clone(),
                subset.to_string(),
            ],
            service_port,
            hash,
        )
    }

    fn is_generated(&self, name: &str) -> bool {
        if name.len() > MAX_NAME_LEN {
            return false;
        }
        let Some(rest) = name
            .strip_prefix(&self.prefix)
            .and_then(|rest| rest.strip_prefix('-'))
        else {
            return false;
        };
        match rest.rsplit_once('-') {
            Some((body, hash)) => {
                !body.is_empty()
                    && hash.len() == HASH_LEN
                    && hash
                        .chars()
                        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
            }
            None => false,
        }
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Shorten the longest fields one character at a time until they fit `budget`
fn trim_evenly(fields: &mut [String], budget: usize) {
    let mut lens: Vec<usize> = fields.iter().map(String::len).collect();
    let total: usize = lens.iter().sum();
    for _ in 0..total.saturating_sub(budget) {
        if let Some(longest) = (0..lens.len()).max_by_key(|&i| (lens[i], std::cmp::Reverse(i))) {
            lens[longest] = lens[longest].saturating_sub(1);
        }
    }
    for (field, len) in fields.iter_mut().zip(lens) {
        field.truncate(len);
    }
}
