use serde_json::Value;

use crate::models::{Example, FieldType, Template};

/// Header of the field table rendered into every extraction prompt.
const FIELD_TABLE_HEADER: &str = "| 序号 | 字段含义 | JSON键名 | 说明 |\n|------|----------|----------|------|";

/// Classification labels the model may answer with.
pub const CLASSIFY_LABELS: [&str; 3] = ["快递单", "抽样单", "测试单"];

/// JSON key the classifier must answer under.
pub const CLASSIFY_KEY: &str = "文档类型";

/// Render the extraction prompt for one template.
///
/// Pure and deterministic: identical `(template, ocr_text)` give byte-identical
/// output. Field and example order is taken from the template as given
/// (resolution already sorted them); inactive examples are skipped. The OCR
/// text is always the tail of the prompt.
pub fn build_extraction_prompt(template: &Template, ocr_text: &str) -> String {
    let doc_type = if template.name.trim().is_empty() {
        "文档"
    } else {
        template.name.as_str()
    };

    let mut prompt = String::with_capacity(1024 + ocr_text.len());
    prompt.push_str(&format!(
        "你是一个专业的数据提取助手，专门处理{doc_type}的OCR识别文本。请从用户提供的文本中精准提取以下字段。\n\n"
    ));

    prompt.push_str("**目标字段：**\n");
    prompt.push_str(&render_field_table(template));
    prompt.push_str("\n\n");

    prompt.push_str(
        "**处理规则：**\n\
         1. 日期格式统一为 YYYY-MM-DD，无法识别的日期设为空字符串 \"\"\n\
         2. 缺失字段值设为空字符串 \"\"\n\
         3. 数值保持原文精度，保留单位\n\
         4. 确保 JSON 语法正确（使用英文双引号、英文逗号）\n\n",
    );

    let examples = render_examples(&template.examples);
    if !examples.is_empty() {
        prompt.push_str(&examples);
        prompt.push('\n');
    }

    prompt.push_str(
        "**输出要求：**\n\
         - 仅输出扁平的 JSON 对象，只包含上述目标字段，禁止添加任何其他字段\n\
         - 不要包含任何解释、引言或 Markdown 代码块标记\n\n",
    );

    prompt.push_str("现在，请处理用户提供的OCR文本：\n");
    prompt.push_str(ocr_text);
    prompt
}

fn render_field_table(template: &Template) -> String {
    let mut table = String::from(FIELD_TABLE_HEADER);
    for (i, field) in template.fields.iter().enumerate() {
        let type_hint = match field.field_type {
            FieldType::Date => "（日期格式：YYYY-MM-DD）",
            FieldType::Number => "（数值类型）",
            FieldType::Text => "",
        };
        let hint = format!("{type_hint} {}", field.extraction_hint.trim());
        table.push_str(&format!(
            "\n| {} | {} | {} | {} |",
            i + 1,
            field.label,
            field.key,
            hint.trim()
        ));
    }
    table
}

fn render_examples(examples: &[Example]) -> String {
    let active: Vec<&Example> = examples.iter().filter(|e| e.is_active).collect();
    if active.is_empty() {
        return String::new();
    }

    let mut section = String::from("**参考示例：**\n");
    for (i, example) in active.iter().enumerate() {
        let n = i + 1;
        section.push_str(&format!(
            "\n示例{n}输入文本片段：\n{}\n\n示例{n}输出：\n{}\n",
            example.input_text.trim(),
            example_output_json(&example.output)
        ));
    }
    section
}

/// Compact JSON for an example output. String outputs holding JSON are
/// re-serialized; other strings are emitted as JSON strings. Non-ASCII is kept.
fn example_output_json(output: &Value) -> String {
    let value = match output {
        Value::String(s) => serde_json::from_str::<Value>(s).unwrap_or_else(|_| output.clone()),
        other => other.clone(),
    };
    value.to_string()
}

/// Prompt asking the model to pick one label for the (already truncated) text.
pub fn build_classification_prompt(ocr_prefix: &str) -> String {
    format!(
        "你是一名单据分类器，仅做一件事：把 OCR 文本归类为以下三种之一。\n\n\
         分类规则（按优先级从高到低判断）：\n\
         1. 快递单：出现\"运单号、快递单号、收件人、寄件人、物流\"等快递特征词。\n\
         2. 抽样单：出现\"抽样编号、抽样基数、备样量、被抽样单位\"等抽样特征词，且不含快递特征词。\n\
         3. 测试单：出现\"检测项目、检测结果、检验依据、检验结论、检验报告\"等词。\n\n\
         输出规范：\n\
         - 仅输出 JSON 对象，禁止解释原因\n\
         - 键名必须为 \"{CLASSIFY_KEY}\"\n\
         - 值只能为 \"{}\"\n\n\
         {ocr_prefix}",
        CLASSIFY_LABELS.join("\" 或 \"")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{field, single};
    use serde_json::json;

    fn lighting_template() -> Template {
        let mut cct = field("cct", "色温", FieldType::Number);
        cct.extraction_hint = "单位K".into();
        let mut t = single(
            "t1",
            "lighting",
            vec![
                field("sample_name", "样品名称", FieldType::Text),
                cct,
                field("test_date", "检测日期", FieldType::Date),
            ],
        );
        t.name = "照明报告".into();
        t.examples = vec![
            Example {
                input_text: "  型号 X1 色温 2700K ".into(),
                output: json!({"sample_name": "X1", "cct": "2700K"}),
                is_active: true,
                sort_order: 0,
            },
            Example {
                input_text: "disabled".into(),
                output: json!({}),
                is_active: false,
                sort_order: 1,
            },
            Example {
                input_text: "型号 Y".into(),
                output: json!("{\"sample_name\": \"Y\"}"),
                is_active: true,
                sort_order: 2,
            },
        ];
        t
    }

    #[test]
    fn prompt_is_deterministic() {
        let t = lighting_template();
        let a = build_extraction_prompt(&t, "型号 ABC 色温 3000K");
        let b = build_extraction_prompt(&t, "型号 ABC 色温 3000K");
        assert_eq!(a, b);
    }

    #[test]
    fn ocr_text_is_the_tail() {
        let t = lighting_template();
        let prompt = build_extraction_prompt(&t, "RAW OCR\nTEXT");
        assert!(prompt.ends_with("RAW OCR\nTEXT"));
    }

    #[test]
    fn field_table_carries_type_hints() {
        let prompt = build_extraction_prompt(&lighting_template(), "x");
        assert!(prompt.contains("| 1 | 样品名称 | sample_name |  |"));
        assert!(prompt.contains("| 2 | 色温 | cct | （数值类型） 单位K |"));
        assert!(prompt.contains("| 3 | 检测日期 | test_date | （日期格式：YYYY-MM-DD） |"));
        assert!(prompt.contains("专门处理照明报告的OCR识别文本"));
    }

    #[test]
    fn examples_rendered_in_order_and_inactive_skipped() {
        let prompt = build_extraction_prompt(&lighting_template(), "x");
        assert!(prompt.contains("**参考示例：**"));
        assert!(prompt.contains("示例1输入文本片段：\n型号 X1 色温 2700K\n\n示例1输出：\n{\"sample_name\":\"X1\",\"cct\":\"2700K\"}"));
        assert!(prompt.contains("示例2输出：\n{\"sample_name\":\"Y\"}"));
        assert!(!prompt.contains("disabled"));
        assert!(prompt.find("示例1").unwrap() < prompt.find("示例2").unwrap());
    }

    #[test]
    fn rules_forbid_extra_fields_and_fences() {
        let prompt = build_extraction_prompt(&lighting_template(), "x");
        assert!(prompt.contains("缺失字段值设为空字符串"));
        assert!(prompt.contains("无法识别的日期设为空字符串"));
        assert!(prompt.contains("保留单位"));
        assert!(prompt.contains("禁止添加任何其他字段"));
        assert!(prompt.contains("Markdown 代码块标记"));
    }

    #[test]
    fn no_examples_section_without_active_examples() {
        let t = single("t1", "express", vec![field("sender", "寄件人", FieldType::Text)]);
        let prompt = build_extraction_prompt(&t, "x");
        assert!(!prompt.contains("参考示例"));
    }

    #[test]
    fn classification_prompt_names_key_and_labels() {
        let prompt = build_classification_prompt("运单号 123");
        assert!(prompt.contains("\"文档类型\""));
        assert!(prompt.contains("\"快递单\" 或 \"抽样单\" 或 \"测试单\""));
        assert!(prompt.ends_with("运单号 123"));
    }
}
