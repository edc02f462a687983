//! # capability 模块说明
//!
//! ## 角色定位（Why）
//! - 端点与端口类型都以“能力标签集合”描述自己支持什么；请求方的集合必须是提供方集合的
//!   子集，协商才算成功；
//! - 协商失败时需要给出“缺了哪些能力”，而不是一句笼统的拒绝。
//!
//! ## 设计要求（What）
//! - 集合不可变，标签统一小写；`key=value` 形式的字符串能力只对键做小写化；
//! - 成员相同的两个集合无论插入顺序如何，编码与相等性都一致；
//! - 编码：4 字节大端个数，随后是按字典序排列的长度前缀 UTF-8 字符串。

use std::{collections::BTreeSet, fmt};

use bytes::{BufMut, Bytes, BytesMut};

use crate::wire::{DecodeError, Reader, put_str};

/// 不可变的能力标签集合。
///
/// # 教案式说明
/// - **意图 (Why)**：为端口类型协商提供可比较、可哈希、可序列化的最小类型系统；
/// - **逻辑 (How)**：标签存放在 `BTreeSet` 中，天然有序，构造时即计算并缓存规范编码；
/// - **契约 (What)**：`matches(other)` 当且仅当 `self` 的每个标签都在 `other` 中；
///   `unmatched(other)` 精确等于差集 `self − other`；
/// - **权衡 (Trade-offs)**：派生集合总是新建副本，换取共享时无需加锁。
#[derive(Clone)]
pub struct CapabilitySet {
    tokens: BTreeSet<String>,
    encoded: Bytes,
}

impl CapabilitySet {
    /// 以若干标签构造集合。
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::from_tokens(tokens.into_iter().map(|token| normalize(token.as_ref())))
    }

    /// 空集合。
    pub fn empty() -> Self {
        Self::from_tokens(core::iter::empty())
    }

    /// 以属性表构造集合。
    ///
    /// 取值为 `1`、`on`、空串、`true`、`yes`（不区分大小写）的键成为布尔能力；
    /// `0`、`off`、`false`、`no` 被忽略；其余取值记为 `key=value` 字符串能力。
    pub fn from_properties<I, K, V>(properties: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        Self::from_tokens(properties.into_iter().filter_map(|(key, value)| {
            let key = key.as_ref().trim().to_ascii_lowercase();
            let value = value.as_ref().trim();
            match value.to_ascii_lowercase().as_str() {
                "" | "1" | "on" | "true" | "yes" => Some(key),
                "0" | "off" | "false" | "no" => None,
                _ => Some(format!("{key}={value}")),
            }
        }))
    }

    /// 从规范编码还原集合；任何格式错误都不会产生部分结果。
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(bytes);
        let count = reader.u32()? as usize;
        let mut tokens = BTreeSet::new();
        for _ in 0..count {
            tokens.insert(normalize(reader.str()?));
        }
        reader.finish()?;
        Ok(Self::from_tokens(tokens))
    }

    fn from_tokens(tokens: impl IntoIterator<Item = String>) -> Self {
        let tokens: BTreeSet<String> = tokens.into_iter().filter(|t| !t.is_empty()).collect();
        let mut buf = BytesMut::new();
        buf.put_u32(tokens.len() as u32);
        for token in &tokens {
            put_str(&mut buf, token);
        }
        Self {
            tokens,
            encoded: buf.freeze(),
        }
    }

    /// 规范编码（缓存）。
    pub fn to_bytes(&self) -> Bytes {
        self.encoded.clone()
    }

    /// 大小写不敏感的成员判断。
    pub fn has(&self, tag: &str) -> bool {
        self.tokens.contains(&normalize(tag))
    }

    /// 读取 `key=value` 字符串能力的取值。
    pub fn value(&self, key: &str) -> Option<&str> {
        let prefix = format!("{}=", key.to_ascii_lowercase());
        self.tokens
            .range(prefix.clone()..)
            .next()
            .and_then(|token| token.strip_prefix(prefix.as_str()))
    }

    /// `self` 的每个标签是否都出现在 `offer` 中。
    pub fn matches(&self, offer: &CapabilitySet) -> bool {
        self.tokens.is_subset(&offer.tokens)
    }

    /// `self` 中 `offer` 不具备的标签。
    pub fn unmatched(&self, offer: &CapabilitySet) -> CapabilitySet {
        Self::from_tokens(self.tokens.difference(&offer.tokens).cloned())
    }

    /// 以 `prefix` 开头的标签构成的子集。
    pub fn with_prefix(&self, prefix: &str) -> CapabilitySet {
        let prefix = prefix.to_ascii_lowercase();
        Self::from_tokens(
            self.tokens
                .iter()
                .filter(|token| token.starts_with(&prefix))
                .cloned(),
        )
    }

    /// 并集。
    pub fn union(&self, other: &CapabilitySet) -> CapabilitySet {
        Self::from_tokens(self.tokens.union(&other.tokens).cloned())
    }

    /// 按字典序遍历标签。
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(String::as_str)
    }

    /// 标签数量。
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// 是否为空集合。
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// 布尔标签整体小写；字符串能力只小写化 `=` 之前的键。
fn normalize(token: &str) -> String {
    let token = token.trim();
    match token.split_once('=') {
        Some((key, value)) => format!("{}={}", key.trim().to_ascii_lowercase(), value.trim()),
        None => token.to_ascii_lowercase(),
    }
}

impl PartialEq for CapabilitySet {
    fn eq(&self, other: &Self) -> bool {
        self.tokens == other.tokens
    }
}

impl Eq for CapabilitySet {}

impl core::hash::Hash for CapabilitySet {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.tokens.hash(state);
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.tokens.iter()).finish()
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for token in &self.tokens {
            if !first {
                f.write_str(" ")?;
            }
            f.write_str(token)?;
            first = false;
        }
        Ok(())
    }
}

impl<S: AsRef<str>> FromIterator<S> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}
