//! 工具目录
//!
//! 启动时从工具服务加载一次，之后只读。每个工具的 inputSchema 归一化为
//! `{type: "object", properties, required}`，字段缺失或格式不对时退回空对象 / 空列表，单个工具的坏 schema 不影响其它工具。

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::tools::ToolDescriptor;

#[derive(Error, Debug)]
pub enum CatalogError {
    /// 工具服务给出了描述，但一个可用的都没有（全部缺少名称）
    #[error("None of the {0} advertised tools is usable")]
    NoUsableTools(usize),
}

/// 归一化后的输入 schema
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputSchema {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub properties: Map<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

/// 每轮原样传给模型的工具定义
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
}

impl ModelToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, properties: Value, required: Vec<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: InputSchema {
                kind: "object",
                properties: match properties {
                    Value::Object(map) => map,
                    _ => Map::new(),
                },
                required,
            },
        }
    }
}

/// 宽松归一化：非对象 schema、非对象 properties、非数组 required 都按空处理；required 中的非字符串项跳过
pub fn normalize_schema(tool: &str, schema: &Value) -> InputSchema {
    let empty = Map::new();
    let obj = match schema {
        Value::Object(o) => o,
        Value::Null => &empty,
        other => {
            tracing::warn!(tool, schema = %other, "input schema is not an object, using empty schema");
            &empty
        }
    };

    let properties = match obj.get("properties") {
        Some(Value::Object(p)) => p.clone(),
        None | Some(Value::Null) => Map::new(),
        Some(other) => {
            tracing::warn!(tool, properties = %other, "malformed schema properties, using empty object");
            Map::new()
        }
    };

    let required = match obj.get("required") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        None | Some(Value::Null) => Vec::new(),
        Some(other) => {
            tracing::warn!(tool, required = %other, "malformed schema required list, ignoring");
            Vec::new()
        }
    };

    InputSchema {
        kind: "object",
        properties,
        required,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    specs: Vec<ModelToolSpec>,
    index: HashMap<String, usize>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_descriptors(descriptors: Vec<ToolDescriptor>) -> Result<Self, CatalogError> {
        let mut catalog = Self::new();
        catalog.load(descriptors)?;
        Ok(catalog)
    }

    /// 加载工具描述，返回新增数量；空名称与重复名称跳过（保留先出现的）
    pub fn load(&mut self, descriptors: Vec<ToolDescriptor>) -> Result<usize, CatalogError> {
        let offered = descriptors.len();
        let mut added = 0;
        for d in descriptors {
            let name = d.name.trim();
            if name.is_empty() {
                tracing::warn!(description = %d.description, "skipping tool without a name");
                continue;
            }
            if self.index.contains_key(name) {
                tracing::warn!(tool = name, "skipping duplicate tool, keeping the first definition");
                continue;
            }
            let spec = ModelToolSpec {
                name: name.to_string(),
                description: d.description.clone(),
                input_schema: normalize_schema(name, &d.input_schema),
            };
            self.index.insert(spec.name.clone(), self.specs.len());
            self.specs.push(spec);
            added += 1;
        }
        if added == 0 && offered > 0 && self.is_empty() {
            return Err(CatalogError::NoUsableTools(offered));
        }
        tracing::info!(tools = added, "tool catalog loaded");
        Ok(added)
    }

    pub fn as_model_tools(&self) -> &[ModelToolSpec] {
        &self.specs
    }

    pub fn get(&self, name: &str) -> Option<&ModelToolSpec> {
        self.index.get(name).map(|&i| &self.specs[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.specs.iter().map(|s| s.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keylime_descriptors() -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor::new("Get_all_agents", "Retrieves a list of all registered agent UUIDs", json!({"type": "object"})),
            ToolDescriptor::new(
                "Get_agent_status",
                "Retrieves the current status information for a specific agent identified by its UUID",
                json!({
                    "type": "object",
                    "properties": {"agent_uuid": {"type": "string"}},
                    "required": ["agent_uuid"]
                }),
            ),
        ]
    }

    #[test]
    fn test_load_normalizes_schemas() {
        let catalog = ToolCatalog::from_descriptors(keylime_descriptors()).unwrap();
        assert_eq!(catalog.len(), 2);

        let list = catalog.get("Get_all_agents").unwrap();
        assert!(list.input_schema.properties.is_empty());
        assert!(list.input_schema.required.is_empty());

        let status = catalog.get("Get_agent_status").unwrap();
        assert_eq!(status.input_schema.required, vec!["agent_uuid"]);
        assert!(status.input_schema.properties.contains_key("agent_uuid"));
    }

    #[test]
    fn test_malformed_schema_does_not_block_others() {
        let descriptors = vec![
            ToolDescriptor::new("broken", "", json!("not a schema")),
            ToolDescriptor::new("weird", "", json!({"properties": [1, 2], "required": ["a", 3, "b"]})),
            ToolDescriptor::new("missing", "", Value::Null),
            ToolDescriptor::new("Reactivate_agent", "Reactivates a failed agent", json!({"properties": {"agent_uuid": {}}})),
        ];
        let catalog = ToolCatalog::from_descriptors(descriptors).unwrap();
        assert_eq!(catalog.len(), 4);
        assert_eq!(catalog.get("weird").unwrap().input_schema.required, vec!["a", "b"]);
        assert!(catalog.get("weird").unwrap().input_schema.properties.is_empty());
        assert!(catalog.contains("Reactivate_agent"));
    }

    #[test]
    fn test_duplicate_and_empty_names_are_skipped() {
        let catalog = ToolCatalog::from_descriptors(vec![
            ToolDescriptor::new("Get_all_agents", "first", json!({})),
            ToolDescriptor::new("  ", "nameless", json!({})),
            ToolDescriptor::new("Get_all_agents", "second", json!({"required": ["x"]})),
            ToolDescriptor::new("Get_agent_status", "", json!({})),
        ])
        .unwrap();
        assert_eq!(catalog.tool_names(), vec!["Get_all_agents", "Get_agent_status"]);
        assert_eq!(catalog.get("Get_all_agents").unwrap().description, "first");
    }

    #[test]
    fn test_only_nameless_tools_is_an_error() {
        let err = ToolCatalog::from_descriptors(vec![ToolDescriptor::new("", "nameless", json!({}))]);
        assert!(matches!(err, Err(CatalogError::NoUsableTools(1))));

        // 服务没有任何工具时只是空目录
        assert!(ToolCatalog::from_descriptors(Vec::new()).unwrap().is_empty());
    }

    #[test]
    fn test_model_tool_wire_format() {
        let catalog = ToolCatalog::from_descriptors(keylime_descriptors()).unwrap();
        let v = serde_json::to_value(catalog.as_model_tools()).unwrap();
        assert_eq!(v[0]["input_schema"]["type"], "object");
        assert!(v[0]["input_schema"].get("required").is_none());
        assert_eq!(v[1]["input_schema"]["required"][0], "agent_uuid");
    }
}
