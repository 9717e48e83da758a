//! 端点（`scheme://host:port`）解析工具

use http::Uri;

use crate::error::{FlareError, Result};

/// 构造端点字符串
pub fn new_endpoint(scheme: &str, host: &str) -> String {
    format!("{}://{}", scheme, host)
}

/// 根据是否启用 TLS 返回 scheme（`grpc` -> `grpcs`）
pub fn scheme(scheme: &str, is_secure: bool) -> String {
    if is_secure {
        format!("{}s", scheme)
    } else {
        scheme.to_string()
    }
}

/// 解析单个端点，返回 `(scheme, host:port)`
///
/// 端点必须包含 scheme、主机和端口
pub fn split_endpoint(endpoint: &str) -> Result<(String, String)> {
    let uri: Uri = endpoint
        .parse()
        .map_err(|e: http::uri::InvalidUri| FlareError::invalid_endpoint(endpoint, e.to_string()))?;
    let scheme = uri
        .scheme_str()
        .ok_or_else(|| FlareError::invalid_endpoint(endpoint, "missing scheme"))?;
    let host = uri
        .host()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| FlareError::invalid_endpoint(endpoint, "missing host"))?;
    let port = uri
        .port_u16()
        .ok_or_else(|| FlareError::invalid_endpoint(endpoint, "missing port"))?;
    Ok((scheme.to_string(), format!("{}:{}", host, port)))
}

/// 在端点列表中查找第一个匹配 scheme 的端点，返回其 `host:port`
///
/// 在找到匹配项之前遇到格式错误的端点会直接返回错误；没有匹配项返回 `Ok(None)`
pub fn parse_endpoint(endpoints: &[String], want_scheme: &str) -> Result<Option<String>> {
    for endpoint in endpoints {
        let (scheme, host) = split_endpoint(endpoint)?;
        if scheme == want_scheme {
            return Ok(Some(host));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_matching_scheme() {
        let endpoints = vec![
            "http://10.0.0.1:8000".to_string(),
            "grpc://10.0.0.1:9090".to_string(),
        ];
        assert_eq!(
            parse_endpoint(&endpoints, "grpc").unwrap(),
            Some("10.0.0.1:9090".to_string())
        );
        assert_eq!(parse_endpoint(&endpoints, "ws").unwrap(), None);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(split_endpoint("10.0.0.1:9090").is_err());
        assert!(split_endpoint("grpc://10.0.0.1").is_err());
        assert!(parse_endpoint(&["not a uri".to_string()], "grpc").is_err());
    }

    #[test]
    fn test_scheme_helpers() {
        assert_eq!(scheme("grpc", true), "grpcs");
        assert_eq!(scheme("grpc", false), "grpc");
        assert_eq!(new_endpoint("grpc", "127.0.0.1:9000"), "grpc://127.0.0.1:9000");
        let (scheme, host) = split_endpoint("grpc://127.0.0.1:9000?isSecure=false").unwrap();
        assert_eq!(scheme, "grpc");
        assert_eq!(host, "127.0.0.1:9000");
    }
}
