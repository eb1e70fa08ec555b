pub mod patterns;

use crate::features::Feature;
use crate::shared::models::PackageContext;
use crate::shared::schema::RawFeatures;

/// Runs the detector catalog over the package corpus.
pub struct PatternAnalysis;

impl Feature for PatternAnalysis {
    fn name(&self) -> &str {
        "pattern_analysis"
    }

    fn extract(&self, ctx: &PackageContext, out: &mut RawFeatures) {
        for detector in patterns::compiled_detectors() {
            let value = if ctx.corpus.is_empty() {
                0.0
            } else {
                detector.evaluate(&ctx.corpus)
            };
            out.set(&detector.feature, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::{Ecosystem, PackageRecord};

    fn analyze(content: &str) -> RawFeatures {
        let ctx = PackageContext::new(PackageRecord::new("test-pkg", Ecosystem::Pypi), content);
        let mut out = RawFeatures::new();
        PatternAnalysis.extract(&ctx, &mut out);
        out
    }

    fn cap_of(feature: &str) -> f64 {
        patterns::compiled_detectors()
            .iter()
            .find(|d| d.feature == feature)
            .map(|d| d.max_value())
            .unwrap()
    }

    // --- Encoding ---

    #[test]
    fn base64_import_python() {
        assert_eq!(analyze("import base64\n").get("base64_imports"), 1.0);
    }

    #[test]
    fn base64_decode_variants() {
        let raw = analyze("base64.b64decode(x)\natob(y)\nBuffer.from(z, 'base64')\n");
        assert_eq!(raw.get("base64_decode_calls"), 3.0);
    }

    #[test]
    fn long_base64_literal() {
        let blob = "A".repeat(64);
        assert_eq!(analyze(&format!("x = '{blob}=='")).get("base64_encoded_strings"), 1.0);
    }

    #[test]
    fn short_tokens_are_not_base64() {
        assert_eq!(analyze("const name = 'hello_world';").get("base64_encoded_strings"), 0.0);
    }

    // --- Crypto ---

    #[test]
    fn fernet_is_binary() {
        let raw = analyze("from cryptography.fernet import Fernet\nf = Fernet(k)\nf2 = Fernet(k)\n");
        assert_eq!(raw.get("fernet_usage"), 1.0);
    }

    #[test]
    fn node_aes_cipher() {
        assert_eq!(analyze("crypto.createCipheriv('aes-256-cbc', k, iv)").get("aes_usage"), 1.0);
    }

    // --- Network ---

    #[test]
    fn http_clients_counted() {
        let raw = analyze("requests.post(url)\nfetch('https://x.io')\naxios.get(u)\n");
        assert_eq!(raw.get("http_requests"), 3.0);
        assert_eq!(raw.get("external_urls_count"), 1.0);
    }

    #[test]
    fn hardcoded_ipv4() {
        assert_eq!(analyze("s.connect(('45.33.12.9', 4444))").get("ip_addresses_hardcoded"), 1.0);
    }

    #[test]
    fn payload_staging_domains() {
        let raw = analyze("u = 'https://pastebin.com/raw/abc'; w = 'https://webhook.site/x'");
        assert_eq!(raw.get("suspicious_domains"), 2.0);
    }

    #[test]
    fn raw_socket_presence() {
        assert_eq!(analyze("s = socket.socket(socket.AF_INET)").get("socket_usage"), 1.0);
    }

    // --- Filesystem ---

    #[test]
    fn ssh_key_path() {
        assert!(analyze("open(os.path.expanduser('~/.ssh/id_rsa'))").get("sensitive_paths_accessed") >= 1.0);
    }

    #[test]
    fn dotenv_file_is_sensitive_but_process_env_is_not() {
        assert_eq!(analyze("fs.readFileSync('.env')").get("sensitive_paths_accessed"), 1.0);
        assert_eq!(analyze("const k = process.env.KEY").get("sensitive_paths_accessed"), 0.0);
    }

    #[test]
    fn file_delete() {
        assert_eq!(analyze("shutil.rmtree(home)").get("file_delete_operations"), 1.0);
    }

    // --- Execution ---

    #[test]
    fn eval_and_exec_counted_separately() {
        let raw = analyze("eval(a)\nexec(b)\nexec(c)\n");
        assert_eq!(raw.get("eval_calls"), 1.0);
        assert_eq!(raw.get("exec_calls"), 2.0);
    }

    #[test]
    fn eval_calls_capped() {
        let raw = analyze(&"eval(x);\n".repeat(500));
        assert_eq!(raw.get("eval_calls"), cap_of("eval_calls"));
    }

    #[test]
    fn subprocess_and_shell() {
        let raw = analyze("subprocess.Popen(['/bin/sh', '-c', cmd])\nos.system('id')\n");
        assert_eq!(raw.get("subprocess_calls"), 1.0);
        assert_eq!(raw.get("os_system_calls"), 1.0);
        assert!(raw.get("shell_commands") >= 1.0);
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert_eq!(analyze("EVAL (payload)").get("eval_calls"), 1.0);
    }

    // --- Credentials and behavior ---

    #[test]
    fn env_access_is_binary() {
        assert_eq!(analyze("os.environ['A'] + os.environ['B']").get("env_var_access"), 1.0);
    }

    #[test]
    fn reverse_shell_phrase_marks_backdoor() {
        let raw = analyze("# spawn a reverse shell back home");
        assert_eq!(raw.get("reverse_shell_patterns"), 1.0);
        assert_eq!(raw.get("backdoor_patterns"), 1.0);
    }

    #[test]
    fn keylogger_import() {
        assert_eq!(analyze("from pynput import keyboard").get("keylogger_patterns"), 1.0);
    }

    #[test]
    fn webcam_and_microphone() {
        let raw = analyze("cap = cv2.VideoCapture(0)\nimport pyaudio\n");
        assert_eq!(raw.get("webcam_access"), 1.0);
        assert_eq!(raw.get("microphone_access"), 1.0);
    }

    #[test]
    fn persistence_mechanisms() {
        let raw = analyze("crontab -l\nwinreg.SetValueEx(k)\necho x >> ~/.bashrc\n");
        assert_eq!(raw.get("cron_job_creation"), 1.0);
        assert_eq!(raw.get("registry_modification"), 1.0);
        assert_eq!(raw.get("startup_modification"), 1.0);
    }

    #[test]
    fn cve_reference() {
        assert_eq!(analyze("// exploit for CVE-2021-44228").get("cve_references"), 1.0);
    }

    // --- Bounding ---

    #[test]
    fn no_detector_exceeds_its_cap() {
        let hostile = "eval(base64.b64decode('QUFB'));exec(x);requests.get('http://1.2.3.4/a');\
                       password token api_key \\x41\\u0041 + 'a' + CVE-2020-1234 "
            .repeat(300);
        let raw = analyze(&hostile);
        for d in patterns::compiled_detectors() {
            assert!(raw.get(&d.feature) <= d.max_value(), "{} exceeded cap", d.feature);
        }
    }

    // --- False positives ---

    #[test]
    fn benign_module_stays_quiet() {
        let raw = analyze(
            "def add(a, b):\n    \"\"\"Return the sum.\"\"\"\n    return a + b\n\nclass Point:\n    pass\n",
        );
        for name in ["eval_calls", "exec_calls", "backdoor_patterns", "http_requests", "shell_commands"] {
            assert_eq!(raw.get(name), 0.0, "{name} fired on benign code");
        }
    }

    #[test]
    fn empty_corpus_is_all_zero() {
        let raw = analyze("");
        assert!(raw.iter().all(|(_, v)| v == 0.0));
    }
}
