//! 配置模块，负责加载 JSON 配置文件

use crate::dialect::DialectKind;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// 表名配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableNames {
    pub sessions: String,
    pub testcases: String,
    pub labels: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            sessions: "sessions".to_string(),
            testcases: "testcases".to_string(),
            labels: "labels".to_string(),
        }
    }
}

/// SQL 编译器配置，缺失的字段使用默认值
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub dialect: DialectKind,
    pub tables: TableNames,
}

impl CompilerConfig {
    /// 从 JSON 文件加载配置
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let display = path_ref.display().to_string();

        // 检查文件是否存在
        if !path_ref.exists() {
            return Err(ConfigError::NotFound(display));
        }

        // 读取文件内容
        let content = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;

        Self::from_json_str(&content).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    /// 从 JSON 字符串解析配置
    pub fn from_json_str(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }
}
