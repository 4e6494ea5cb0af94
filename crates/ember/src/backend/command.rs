//! `spark-submit` argument construction.

use std::collections::BTreeMap;

use crate::session::SubmitParams;

use super::{BackendError, BackendResult, SubmitConfig};

/// Build the `spark-submit` argument list for a session.
///
/// Backend `--conf` entries are applied first so session entries win.
pub fn build_submit_args(params: &SubmitParams, config: &SubmitConfig) -> BackendResult<Vec<String>> {
    if params.file.trim().is_empty() {
        return Err(BackendError::InvalidSubmission(
            "application file cannot be empty".to_string(),
        ));
    }

    let name = if params.name.trim().is_empty() {
        config.app_id.as_str()
    } else {
        params.name.as_str()
    };

    let mut args = vec![
        "--master".to_string(),
        config.master.clone(),
        "--deploy-mode".to_string(),
        config.deploy_mode.as_str().to_string(),
        "--name".to_string(),
        name.to_string(),
    ];

    if let Some(ref class) = params.main_class {
        push_pair(&mut args, "--class", class);
    }
    push_list(&mut args, "--jars", &params.jars);
    push_list(&mut args, "--py-files", &params.py_files);
    push_list(&mut args, "--files", &params.files);
    if let Some(ref memory) = params.driver_memory {
        push_pair(&mut args, "--driver-memory", memory);
    }
    if let Some(cores) = params.driver_cores {
        push_pair(&mut args, "--driver-cores", &cores.to_string());
    }
    if let Some(ref memory) = params.executor_memory {
        push_pair(&mut args, "--executor-memory", memory);
    }
    if let Some(cores) = params.executor_cores {
        push_pair(&mut args, "--executor-cores", &cores.to_string());
    }
    if let Some(count) = params.num_executors {
        push_pair(&mut args, "--num-executors", &count.to_string());
    }

    let mut conf: BTreeMap<&str, &str> = config
        .conf
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    conf.extend(params.conf.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    for (key, value) in conf {
        push_pair(&mut args, "--conf", &format!("{key}={value}"));
    }

    args.push(params.file.clone());
    args.extend(params.args.iter().cloned());

    Ok(args)
}

fn push_pair(args: &mut Vec<String>, flag: &str, value: &str) {
    args.push(flag.to_string());
    args.push(value.to_string());
}

fn push_list(args: &mut Vec<String>, flag: &str, values: &[String]) {
    if !values.is_empty() {
        push_pair(args, flag, &values.join(","));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DeployMode;
    use std::path::PathBuf;

    fn config() -> SubmitConfig {
        SubmitConfig {
            spark_submit: PathBuf::from("spark-submit"),
            master: "k8s://https://cluster:6443".to_string(),
            deploy_mode: DeployMode::Cluster,
            app_id: "ember-abc".to_string(),
            conf: BTreeMap::from([
                ("spark.kubernetes.namespace".to_string(), "spark".to_string()),
                ("spark.ui.enabled".to_string(), "true".to_string()),
            ]),
            env: BTreeMap::new(),
        }
    }

    #[test]
    fn session_conf_overrides_backend_conf() {
        let params = SubmitParams {
            name: "etl".to_string(),
            file: "local:///opt/app.py".to_string(),
            conf: BTreeMap::from([("spark.ui.enabled".to_string(), "false".to_string())]),
            ..Default::default()
        };

        let args = build_submit_args(&params, &config()).unwrap();
        assert!(args.contains(&"spark.ui.enabled=false".to_string()));
        assert!(!args.contains(&"spark.ui.enabled=true".to_string()));
        assert!(args.contains(&"spark.kubernetes.namespace=spark".to_string()));
    }

    #[test]
    fn application_file_and_args_come_last() {
        let params = SubmitParams {
            name: "wordcount".to_string(),
            file: "local:///opt/wordcount.jar".to_string(),
            main_class: Some("org.example.WordCount".to_string()),
            args: vec!["in".to_string(), "out".to_string()],
            jars: vec!["a.jar".to_string(), "b.jar".to_string()],
            executor_cores: Some(2),
            ..Default::default()
        };

        let args = build_submit_args(&params, &config()).unwrap();
        assert_eq!(&args[..6], &[
            "--master",
            "k8s://https://cluster:6443",
            "--deploy-mode",
            "cluster",
            "--name",
            "wordcount"
        ]);
        assert_eq!(&args[args.len() - 3..], &["local:///opt/wordcount.jar", "in", "out"]);
        let jars = args.iter().position(|a| a == "--jars").unwrap();
        assert_eq!(args[jars + 1], "a.jar,b.jar");
        let class = args.iter().position(|a| a == "--class").unwrap();
        assert_eq!(args[class + 1], "org.example.WordCount");
    }

    #[test]
    fn missing_name_falls_back_to_app_id() {
        let params = SubmitParams {
            file: "app.py".to_string(),
            ..Default::default()
        };
        let args = build_submit_args(&params, &config()).unwrap();
        let name = args.iter().position(|a| a == "--name").unwrap();
        assert_eq!(args[name + 1], "ember-abc");
    }

    #[test]
    fn empty_file_is_rejected() {
        let err = build_submit_args(&SubmitParams::default(), &config()).unwrap_err();
        assert!(matches!(err, BackendError::InvalidSubmission(_)));
    }
}
