use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::net::{Ipv4Addr, Ipv6Addr};
use x509_parser::prelude::*;

/// Owned metadata pulled out of one parsed certificate. This is everything
/// the cache keeps about a cert; the DER itself is dropped once the
/// fingerprint is computed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertInfo {
    pub common_name: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<String>,
    /// Hex SHA-1 over the DER body. The identity of a certificate across
    /// backends.
    pub fingerprint: String,
}

/// One certificate recovered from a secret value. `yaml_path` is set when
/// the cert was found inside a YAML document rather than directly in the
/// blob, and holds the dotted key path to the string that contained it.
#[derive(Debug, Clone)]
pub struct ExtractedCert {
    pub yaml_path: Option<String>,
    pub info: CertInfo,
}

/// Pulls certificates out of a raw secret value.
///
/// The blob is scanned for PEM blocks first. If it contains any
/// CERTIFICATE blocks, the leaf of the (possibly single-element) chain is
/// returned. If it contains no PEM at all, the blob is parsed as YAML and
/// every reachable string is fed back through the PEM scanner.
pub fn extract(blob: &str) -> Vec<ExtractedCert> {
    let ders = scan_pem(blob.as_bytes());
    if !ders.is_empty() {
        return select_leaf(&ders)
            .map(|info| ExtractedCert {
                yaml_path: None,
                info,
            })
            .into_iter()
            .collect();
    }

    let doc: serde_yaml::Value = match serde_yaml::from_str(blob) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };

    let mut found = Vec::new();
    walk_yaml(&doc, &mut Vec::new(), &mut found);
    found
}

/// Collects the DER bodies of every PEM block typed exactly CERTIFICATE
/// that parses as X.509. Keys, parameters, and unparseable blocks are
/// ignored.
fn scan_pem(blob: &[u8]) -> Vec<Vec<u8>> {
    Pem::iter_from_buffer(blob)
        .filter_map(|block| block.ok())
        .filter(|block| block.label == "CERTIFICATE")
        .filter(|block| parse_x509_certificate(&block.contents).is_ok())
        .map(|block| block.contents)
        .collect()
}

/// Picks the leaf out of a chain of DER certificates.
///
/// Chains in the wild come in exactly two orderings. If the first cert's
/// signature verifies against the second cert's public key, the first cert
/// was issued by the second and the chain runs leaf to root; otherwise the
/// chain is assumed to run root to leaf and the last cert is the leaf.
/// Mixed orderings are not supported.
fn select_leaf(ders: &[Vec<u8>]) -> Option<CertInfo> {
    let certs: Vec<X509Certificate> = ders
        .iter()
        .filter_map(|der| parse_x509_certificate(der).ok())
        .map(|(_, cert)| cert)
        .collect();

    let leaf_idx = match certs.len() {
        0 => return None,
        1 => 0,
        _ => {
            if signed_by(&certs[0], &certs[1]) {
                0
            } else {
                certs.len() - 1
            }
        }
    };

    Some(CertInfo::from_x509(&certs[leaf_idx], &ders[leaf_idx]))
}

fn signed_by(child: &X509Certificate, parent: &X509Certificate) -> bool {
    child.verify_signature(Some(parent.public_key())).is_ok()
}

fn walk_yaml(value: &serde_yaml::Value, path: &mut Vec<String>, out: &mut Vec<ExtractedCert>) {
    match value {
        serde_yaml::Value::String(s) => {
            let ders = scan_pem(s.as_bytes());
            if let Some(info) = select_leaf(&ders) {
                let yaml_path = if path.is_empty() {
                    "(root)".to_string()
                } else {
                    path.join(".")
                };
                out.push(ExtractedCert {
                    yaml_path: Some(yaml_path),
                    info,
                });
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (key, val) in map {
                let segment = match key {
                    serde_yaml::Value::String(s) => s.clone(),
                    serde_yaml::Value::Number(n) => n.to_string(),
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    _ => continue,
                };
                path.push(segment);
                walk_yaml(val, path, out);
                path.pop();
            }
        }
        serde_yaml::Value::Sequence(seq) => {
            for (idx, val) in seq.iter().enumerate() {
                path.push(idx.to_string());
                walk_yaml(val, path, out);
                path.pop();
            }
        }
        serde_yaml::Value::Tagged(tagged) => walk_yaml(&tagged.value, path, out),
        _ => {}
    }
}

impl CertInfo {
    fn from_x509(cert: &X509Certificate, der: &[u8]) -> Self {
        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string();

        let not_before = DateTime::from_timestamp(cert.validity().not_before.timestamp(), 0)
            .unwrap_or_else(Utc::now);
        let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
            .unwrap_or_else(Utc::now);

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        for ext in cert.extensions() {
            if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                        GeneralName::IPAddress(bytes) => {
                            if let Some(addr) = format_ip(bytes) {
                                ip_addresses.push(addr);
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        let fingerprint = hex::encode(Sha1::digest(der));

        CertInfo {
            common_name,
            not_before,
            not_after,
            dns_names,
            ip_addresses,
            fingerprint,
        }
    }
}

fn format_ip(bytes: &[u8]) -> Option<String> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(Ipv4Addr::from(octets).to_string())
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(Ipv6Addr::from(octets).to_string())
        }
        _ => None,
    }
}
