//! Deep-merging of a user workload with the administrator's job template.

use serde_json::Value;

/// Recursively merges two JSON objects into a new one; `template` wins over
/// `user` at every leaf.
///
/// - Mappings merge key-wise: the result carries the union of both key sets,
///   and values under shared keys are merged recursively.
/// - Sequences concatenate, user elements first.
/// - Scalars and mismatched shapes resolve to the template's value.
///
/// Neither input is mutated. Administrators rely on the precedence to force
/// scheduling, backoff, and security fields users must not override.
pub fn merge_json_objects(user: &Value, template: &Value) -> Value {
    match (user, template) {
        (Value::Object(user_map), Value::Object(template_map)) => {
            let mut merged = user_map.clone();
            for (key, template_value) in template_map {
                let merged_value = match user_map.get(key) {
                    Some(user_value) => merge_json_objects(user_value, template_value),
                    None => template_value.clone(),
                };
                merged.insert(key.clone(), merged_value);
            }
            Value::Object(merged)
        }
        (Value::Array(user_items), Value::Array(template_items)) => Value::Array(
            user_items
                .iter()
                .chain(template_items)
                .cloned()
                .collect(),
        ),
        (_, template_value) => template_value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn template_scalar_wins_at_every_leaf() {
        let user = json!({"spec": {"backoffLimit": 4, "suspend": false}});
        let template = json!({"spec": {"backoffLimit": 0}});

        let merged = merge_json_objects(&user, &template);
        assert_eq!(merged["spec"]["backoffLimit"], json!(0));
        assert_eq!(merged["spec"]["suspend"], json!(false));
    }

    #[test]
    fn sequences_concatenate_user_first() {
        let user = json!({"tolerations": [{"key": "a"}]});
        let template = json!({"tolerations": [{"key": "b"}, {"key": "c"}]});

        let merged = merge_json_objects(&user, &template);
        assert_eq!(
            merged["tolerations"],
            json!([{"key": "a"}, {"key": "b"}, {"key": "c"}])
        );
    }

    #[test]
    fn mappings_union_their_keys() {
        let user = json!({"metadata": {"name": "mine", "labels": {"user": "label"}}});
        let template = json!({"metadata": {"annotations": {"admin": "note"}}});

        let merged = merge_json_objects(&user, &template);
        assert_eq!(merged["metadata"]["name"], json!("mine"));
        assert_eq!(merged["metadata"]["labels"], json!({"user": "label"}));
        assert_eq!(merged["metadata"]["annotations"], json!({"admin": "note"}));
    }

    #[test]
    fn mismatched_shapes_resolve_to_the_template() {
        let user = json!({"value": [1, 2, 3]});
        let template = json!({"value": {"replaced": true}});

        let merged = merge_json_objects(&user, &template);
        assert_eq!(merged["value"], json!({"replaced": true}));
    }

    #[test]
    fn inputs_are_not_mutated() {
        let user = json!({"spec": {"backoffLimit": 4}});
        let template = json!({"spec": {"backoffLimit": 0}});
        let (user_before, template_before) = (user.clone(), template.clone());

        let _ = merge_json_objects(&user, &template);
        assert_eq!(user, user_before);
        assert_eq!(template, template_before);
    }

    /// An admin template forcing node affinity and a zero backoff wins over a
    /// user submission that specifies its own backoff.
    #[test]
    fn node_affinity_template_overrides_user_backoff() {
        let template: Value = serde_yaml::from_str(
            "
spec:
  backoffLimit: 0
  template:
    spec:
      affinity:
        nodeAffinity:
          requiredDuringSchedulingIgnoredDuringExecution:
            nodeSelectorTerms:
            - matchExpressions:
              - key: hub.jupyter.org/node-purpose
                operator: In
                values: [user]
",
        )
        .expect("template YAML is valid");
        let user = json!({
            "metadata": {"generateName": "my-job-"},
            "spec": {
                "backoffLimit": 4,
                "template": {"spec": {"containers": [{"name": "job", "image": "alpine"}]}},
            },
        });

        let merged = merge_json_objects(&user, &template);
        assert_eq!(merged["spec"]["backoffLimit"], json!(0));
        let terms = &merged["spec"]["template"]["spec"]["affinity"]["nodeAffinity"]
            ["requiredDuringSchedulingIgnoredDuringExecution"]["nodeSelectorTerms"][0]
            ["matchExpressions"][0];
        assert_eq!(terms["key"], json!("hub.jupyter.org/node-purpose"));
        assert_eq!(terms["operator"], json!("In"));
        assert_eq!(terms["values"], json!(["user"]));
        assert_eq!(
            merged["spec"]["template"]["spec"]["containers"][0]["image"],
            json!("alpine")
        );
    }
}
