// 该文件是 Kanjian （看见） 项目的一部分。
// src/model/labels.rs - 类别标签表
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::path::Path;

/// 类别编号到名称的映射，编号从 0 开始
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelTable {
  names: Vec<String>,
}

impl From<Vec<String>> for LabelTable {
  fn from(names: Vec<String>) -> Self {
    Self { names }
  }
}

impl LabelTable {
  /// 每行一个类别名称，空行跳过
  pub fn from_file(path: &Path) -> Result<Self, std::io::Error> {
    let content = std::fs::read_to_string(path)?;
    Ok(Self::from_lines(&content))
  }

  pub fn from_lines(content: &str) -> Self {
    let names = content
      .lines()
      .map(str::trim)
      .filter(|line| !line.is_empty())
      .map(str::to_string)
      .collect();
    Self { names }
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }

  /// 未知编号返回 `class_{id}`
  pub fn name(&self, id: usize) -> String {
    self
      .names
      .get(id)
      .cloned()
      .unwrap_or_else(|| format!("class_{id}"))
  }
}

/// 元数据中允许的类别编号上限，超出时视为元数据无效
const MAX_LABEL_ID: usize = 65_536;

/// 解析 Ultralytics 导出模型元数据中的 `names` 字段
///
/// 格式形如 `{0: 'person', 1: 'bicycle'}`，编号不连续时按编号放置，缺失的编号留空。
pub fn parse_ultralytics_names(raw: &str) -> Option<LabelTable> {
  let body = raw.trim().strip_prefix('{')?.strip_suffix('}')?;
  let mut entries: Vec<(usize, String)> = Vec::new();

  let mut rest = body.trim();
  while !rest.is_empty() {
    let (id, after_id) = rest.split_once(':')?;
    let id: usize = id.trim().parse().ok()?;

    let after_id = after_id.trim_start();
    let quote = after_id.chars().next()?;
    if quote != '\'' && quote != '"' {
      return None;
    }
    let value_and_tail = &after_id[1..];
    let end = value_and_tail.find(quote)?;
    entries.push((id, value_and_tail[..end].to_string()));

    rest = value_and_tail[end + 1..].trim_start();
    rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
  }

  let mut size: usize = 0;
  for (id, _) in &entries {
    if *id >= MAX_LABEL_ID {
      return None;
    }
    size = size.max(id + 1);
  }
  let mut names = vec![String::new(); size];
  for (id, name) in entries {
    names[id] = name;
  }
  Some(LabelTable { names })
}
