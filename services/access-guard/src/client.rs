//! 客户端标识
//!
//! 只依赖请求头，不访问存储

use http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::submission::generate_identifier;

/// 客户端指纹请求头
pub const FINGERPRINT_HEADER: &str = "x-client-fingerprint";

/// 没有代理头时使用的占位地址
pub const LOOPBACK_PLACEHOLDER: &str = "127.0.0.1";

const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";

/// 请求方标识
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl ClientIdentity {
    pub fn new(ip: impl Into<String>, fingerprint: Option<String>) -> Self {
        Self {
            ip: ip.into(),
            fingerprint: fingerprint.filter(|fp| !fp.trim().is_empty()),
        }
    }

    /// 从代理头提取：`x-forwarded-for` 第一项，其次 `x-real-ip`，否则回环占位
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let ip = header_str(headers, FORWARDED_FOR)
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .or_else(|| header_str(headers, REAL_IP).map(str::trim).filter(|ip| !ip.is_empty()))
            .unwrap_or(LOOPBACK_PLACEHOLDER);

        let fingerprint = header_str(headers, FINGERPRINT_HEADER).map(|fp| fp.trim().to_string());

        Self::new(ip, fingerprint)
    }

    /// 防重复提交用的组合标识
    pub fn submission_identifier(&self) -> String {
        generate_identifier(&self.ip, self.fingerprint.as_deref())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
