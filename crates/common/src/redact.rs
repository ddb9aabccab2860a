//! 日志脱敏

/// 邮箱脱敏：保留本地部分前两位和域名
///
/// `alice@example.com` -> `al***@example.com`
pub fn redact_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            let visible: String = local.chars().take(2).collect();
            format!("{}***@{}", visible, domain)
        }
        None => "***".to_string(),
    }
}

/// 哈希前缀（用于诊断日志）
pub fn hash_prefix(hash: &str) -> &str {
    let end = hash
        .char_indices()
        .nth(8)
        .map(|(idx, _)| idx)
        .unwrap_or(hash.len());
    &hash[..end]
}

/// IP 脱敏：IPv4 保留前两段，其他只保留前 8 个字符
pub fn redact_ip(ip: &str) -> String {
    let octets: Vec<&str> = ip.split('.').collect();
    if octets.len() == 4 {
        return format!("{}.{}.x.x", octets[0], octets[1]);
    }
    let visible: String = ip.chars().take(8).collect();
    format!("{}…", visible)
}
