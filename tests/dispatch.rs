use std::fs;

use remcc::dispatch::{ExecResponse, OutputFile, EXEC_PATH};
use remcc::{CompileInvocation, CompileRequest, Context, DispatcherOptions};

mod util;

use util::{init, ok_response, MockHttpServer, MockReply};

#[test]
fn remote_compile_writes_outputs() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let src_dir = dir.path().to_string_lossy().into_owned();
    fs::write(
        dir.path().join("foo.c"),
        "#include \"foo.h\"\nint main(void) { return FOO; }\n",
    )
    .unwrap();
    fs::write(
        dir.path().join("foo.h"),
        "#ifndef FOO_H\n#define FOO_H\n#define FOO 0\n#endif\n",
    )
    .unwrap();

    let server = MockHttpServer::start(|req| {
        // The dispatcher ships the normalized request; echo back one
        // object file.
        assert_eq!(req.path(), EXEC_PATH);
        let decoded: CompileRequest = bincode::deserialize(&req.body).unwrap();
        assert_eq!(decoded.command_spec.name, "gcc");
        assert!(decoded
            .inputs
            .iter()
            .any(|i| i.filename.ends_with("foo.c")));
        assert!(decoded
            .inputs
            .iter()
            .any(|i| i.filename.ends_with("foo.h")));
        assert!(decoded.inputs.iter().all(|i| !i.hash_key.is_empty()));
        let resp = ExecResponse {
            ok: true,
            error_message: String::new(),
            outputs: vec![OutputFile {
                filename: "foo.o".to_string(),
                content: b"ELF-ish object bytes".to_vec(),
            }],
        };
        MockReply::Respond(ok_response(&bincode::serialize(&resp).unwrap()))
    });

    let options = DispatcherOptions {
        dest_host_name: "127.0.0.1".to_string(),
        dest_port: server.port,
        num_worker_threads: 2,
        ..Default::default()
    };
    let ctx = Context::new(options).unwrap();

    let invocation = CompileInvocation {
        args: vec![
            "gcc".to_string(),
            "-O2".to_string(),
            "-c".to_string(),
            "foo.c".to_string(),
            "-o".to_string(),
            "foo.o".to_string(),
        ],
        cwd: src_dir.clone(),
        env: vec!["PATH=/usr/bin:/bin".to_string()],
    };
    let outcome = ctx.dispatch(&invocation).unwrap();
    assert!(outcome.remote);
    assert_eq!(outcome.exit_status, 0);
    assert_eq!(outcome.cache_key.len(), 64);

    let object = fs::read(dir.path().join("foo.o")).unwrap();
    assert_eq!(object, b"ELF-ish object bytes");

    // Identical invocations produce the identical cache key.
    let outcome2 = ctx.dispatch(&invocation).unwrap();
    assert_eq!(outcome.cache_key, outcome2.cache_key);

    ctx.shutdown();
}

#[test]
fn server_side_compile_failure_is_not_retried_locally() {
    init();
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("bad.c"), "int main(void) { return 0 }\n").unwrap();

    let server = MockHttpServer::start(|_req| {
        let resp = ExecResponse {
            ok: false,
            error_message: "bad.c:1: expected ';'".to_string(),
            outputs: Vec::new(),
        };
        MockReply::Respond(ok_response(&bincode::serialize(&resp).unwrap()))
    });

    let options = DispatcherOptions {
        dest_host_name: "127.0.0.1".to_string(),
        dest_port: server.port,
        num_worker_threads: 2,
        ..Default::default()
    };
    let ctx = Context::new(options).unwrap();
    let invocation = CompileInvocation {
        args: vec![
            "gcc".to_string(),
            "-c".to_string(),
            "bad.c".to_string(),
        ],
        cwd: dir.path().to_string_lossy().into_owned(),
        env: Vec::new(),
    };
    let err = ctx.dispatch(&invocation).unwrap_err();
    assert!(err.to_string().contains("expected ';'"));
    ctx.shutdown();
}
