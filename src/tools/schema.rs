//! 工具参数 JSON Schema 生成（schemars）
//!
//! 各工具的参数结构体 derive JsonSchema，注册表据此在 prompt 中描述每个动作的 params。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 生成参数结构体的 JSON Schema（去掉 `$schema` / `title` 元信息）
pub fn params_schema<P: JsonSchema>() -> Value {
    let schema = schema_for!(P);
    let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| serde_json::json!({ "type": "object" }));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(dead_code)]
    #[derive(JsonSchema)]
    struct SearchParams {
        /// 查询文本
        query: String,
        page: Option<usize>,
    }

    #[test]
    fn test_schema_lists_properties_and_required() {
        let schema = params_schema::<SearchParams>();
        assert!(schema.get("$schema").is_none());
        assert!(schema["properties"]["query"].is_object());
        assert!(schema["properties"]["page"].is_object());
        let required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert_eq!(required, vec!["query"]);
    }
}
