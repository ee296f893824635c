use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// クラスインデックス→グロスのラベル表
///
/// ファイル形式は1行1エントリの "インデックス,ラベル"。
pub struct LabelTable {
    map: HashMap<usize, String>,
}

impl LabelTable {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read label file {}", path.as_ref().display()))?;
        Ok(Self::parse(&content))
    }

    /// 不正な行は読み飛ばす
    pub fn parse(content: &str) -> Self {
        let mut map = HashMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((index, label)) = line.split_once(',') else {
                log::warn!("malformed label line: {:?}", line);
                continue;
            };
            let Ok(index) = index.trim().parse::<usize>() else {
                log::warn!("malformed label index: {:?}", line);
                continue;
            };
            map.insert(index, label.trim().to_string());
        }
        Self { map }
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.map.get(&index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let table = LabelTable::parse("0,xin chào\n1,cảm ơn\n2,tạm biệt\n");
        assert_eq!(table.len(), 3);
        assert_eq!(table.get(0), Some("xin chào"));
        assert_eq!(table.get(2), Some("tạm biệt"));
    }

    #[test]
    fn test_parse_skips_malformed_lines() {
        let table = LabelTable::parse("0,hello\nnot-a-line\nx,oops\n\n1,world\n");
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(1), Some("world"));
    }

    #[test]
    fn test_label_with_embedded_comma() {
        // 最初のカンマのみ区切りとして扱う
        let table = LabelTable::parse("5,one, two\n");
        assert_eq!(table.get(5), Some("one, two"));
    }

    #[test]
    fn test_missing_index() {
        let table = LabelTable::parse("0,hello\n");
        assert_eq!(table.get(42), None);
    }
}
