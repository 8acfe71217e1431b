// Integration tests for the Hemlock compiler and VM.
//
// Each test compiles a complete program, runs it on a fresh VM with a
// captured output sink, and checks printed output, resulting globals, or the
// reported runtime error. Coverage:
// - closures and upvalue capture
// - control flow (if/while/for/for-in/switch fallthrough)
// - exception handling and defer ordering
// - tasks and channels
// - value semantics (indexing, runes, serialization, numeric promotion)

use std::sync::{Arc, Mutex};

use hemlock::compiler::compile_program;
use hemlock::parser::parse_program;
use hemlock::value::{format_value, Value};
use hemlock::vm::{Output, UncaughtError, Vm};

fn run_vm(source: &str) -> (Vm, Result<Value, UncaughtError>, String) {
    let program = parse_program(source).expect("parse error");
    let chunk = compile_program(&program).expect("compile error");
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let mut vm = Vm::with_output(Output::Capture(Arc::clone(&buffer)));
    let result = vm.interpret(chunk);
    let output = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
    (vm, result, output)
}

fn run_output(source: &str) -> String {
    let (_, result, output) = run_vm(source);
    result.expect("runtime error");
    output
}

fn run_global(source: &str, name: &str) -> Value {
    let (vm, result, _) = run_vm(source);
    result.expect("runtime error");
    vm.globals.get(name).cloned().unwrap_or_else(|| panic!("global {} not set", name))
}

fn run_error(source: &str) -> UncaughtError {
    let (_, result, _) = run_vm(source);
    result.expect_err("expected a runtime error")
}

// ----- end-to-end programs -----

#[test]
fn closure_counter_increments_shared_upvalue() {
    let source = r#"
        let make = fn() { let n = 0; return fn() { n = n + 1; return n; }; };
        let c = make();
        print(c()); print(c()); print(c());
    "#;
    assert_eq!(run_output(source), "1\n2\n3\n");
}

#[test]
fn for_in_over_object_with_key_and_value() {
    let source = r#"
        let o = {a: 1, b: 2, c: 3};
        let sum = 0;
        for (k, v in o) { sum = sum + v; }
        print(sum);
    "#;
    assert_eq!(run_output(source), "6\n");
}

#[test]
fn try_catch_finally_with_throw() {
    let source = r#"
        try { throw "boom"; } catch (e) { print("caught:", e); } finally { print("done"); }
    "#;
    assert_eq!(run_output(source), "caught: boom\ndone\n");
}

#[test]
fn switch_falls_through_until_break() {
    let source = r#"
        let x = 2;
        switch (x) {
            case 1: print("one"); break;
            case 2: print("two");
            case 3: print("three"); break;
            default: print("other");
        }
    "#;
    assert_eq!(run_output(source), "two\nthree\n");
}

#[test]
fn channel_rendezvous_across_tasks() {
    let source = r#"
        let ch = channel();
        let t = spawn(async fn() { ch.send(42); });
        print(ch.recv());
        join(t);
    "#;
    assert_eq!(run_output(source), "42\n");
}

#[test]
fn array_map_filter_reduce_chain() {
    let source = r#"
        let xs = [1,2,3,4,5];
        print(xs.filter(fn(n){ return n%2==0; }).map(fn(n){ return n*n; }).reduce(fn(a,b){ return a+b; }, 0));
    "#;
    assert_eq!(run_output(source), "20\n");
}

// ----- closures and scoping -----

#[test]
fn two_closures_share_one_upvalue() {
    let source = r#"
        let make = fn() {
            let x = 0;
            let inc = fn() { x = x + 1; };
            let get = fn() { return x; };
            inc(); inc();
            return get();
        };
        print(make());
    "#;
    assert_eq!(run_output(source), "2\n");
}

#[test]
fn block_scope_shadowing_is_contained() {
    let source = r#"
        let f = fn() { let x = 1; { let x = 2; x = x + 1; } return x; };
        print(f());
    "#;
    assert_eq!(run_output(source), "1\n");
}

#[test]
fn upvalue_survives_frame_exit() {
    let source = r#"
        let hold = fn() { let v = "kept"; return fn() { return v; }; };
        let get = hold();
        print(get());
    "#;
    assert_eq!(run_output(source), "kept\n");
}

// ----- parameters -----

#[test]
fn optional_and_rest_parameters() {
    let source = r#"
        let f = fn(a, b = 10, ...rest) { return a + b + rest.length; };
        print(f(1));
        print(f(1, 2));
        print(f(1, 2, 9, 9, 9));
    "#;
    assert_eq!(run_output(source), "11\n3\n6\n");
}

#[test]
fn arity_error_is_catchable() {
    let source = r#"
        let f = fn(a, b) { return a; };
        try { f(1); } catch (e) { print(e); }
    "#;
    assert_eq!(run_output(source), "Expected 2 arguments but got 1\n");
}

// ----- control flow -----

#[test]
fn for_loop_with_break_and_continue() {
    let source = r#"
        let s = 0;
        for (let i = 0; i < 10; i++) {
            if (i % 2 == 0) { continue; }
            if (i > 5) { break; }
            s = s + i;
        }
        print(s);
    "#;
    assert_eq!(run_output(source), "9\n");
}

#[test]
fn continue_inside_switch_targets_enclosing_loop() {
    let source = r#"
        let i = 0; let s = 0;
        while (i < 4) {
            i = i + 1;
            switch (i) { case 2: continue; }
            s = s + i;
        }
        print(s);
    "#;
    assert_eq!(run_output(source), "8\n");
}

#[test]
fn for_in_over_array_binds_values() {
    let source = r#"
        let total = 0;
        for (x in [10, 20, 30]) { total = total + x; }
        print(total);
    "#;
    assert_eq!(run_output(source), "60\n");
}

#[test]
fn ternary_and_logical_short_circuit() {
    let source = r#"
        let called = 0;
        let bump = fn() { called = called + 1; return true; };
        let x = false && bump();
        let y = true || bump();
        print(called, x, y, 1 < 2 ? "yes" : "no");
    "#;
    assert_eq!(run_output(source), "0 false true yes\n");
}

// ----- exceptions and defer -----

#[test]
fn rethrow_from_catch_reaches_outer_handler() {
    let source = r#"
        try {
            try { throw "inner"; } catch (e) { throw "outer"; }
        } catch (e) { print(e); }
    "#;
    assert_eq!(run_output(source), "outer\n");
}

#[test]
fn try_finally_without_catch_swallows_after_cleanup() {
    let source = r#"
        try { throw "gone"; } finally { print("fin"); }
        print("after");
    "#;
    assert_eq!(run_output(source), "fin\nafter\n");
}

#[test]
fn defers_run_lifo_on_return() {
    let source = r#"
        let f = fn() { defer print("a"); defer print("b"); print("body"); return 1; };
        f();
    "#;
    assert_eq!(run_output(source), "body\nb\na\n");
}

#[test]
fn defers_run_when_exception_unwinds_frame() {
    let source = r#"
        let f = fn() { defer print("cleanup"); throw "x"; };
        try { f(); } catch (e) { print("caught", e); }
    "#;
    assert_eq!(run_output(source), "cleanup\ncaught x\n");
}

#[test]
fn uncaught_exception_reports_message_and_trace() {
    let error = run_error(r#"
        let inner = fn() { throw "kaboom"; };
        inner();
    "#);
    assert_eq!(error.message, "kaboom");
    assert_eq!(error.trace.first().map(|f| f.name.as_str()), Some("inner"));
    assert_eq!(error.trace.last().map(|f| f.name.as_str()), Some("<script>"));
}

#[test]
fn division_and_modulo_by_zero_are_catchable() {
    let source = r#"
        let msgs = [];
        try { let x = 1 / 0; } catch (e) { msgs.push(e); }
        try { let y = divi(1, 0); } catch (e) { msgs.push(e); }
        try { let z = modi(1, 0); } catch (e) { msgs.push(e); }
        print(msgs.length, msgs[0]);
    "#;
    assert_eq!(run_output(source), "3 Division by zero\n");
}

#[test]
fn const_reassignment_fails_at_runtime_for_globals() {
    let error = run_error("const k = 1; k = 2;");
    assert_eq!(error.message, "Cannot reassign constant 'k'");
}

#[test]
fn undefined_variable_is_a_runtime_error() {
    let error = run_error("print(definitely_not_defined);");
    assert!(error.message.contains("Undefined variable"));
}

// ----- operators on values -----

#[test]
fn division_always_yields_f64() {
    assert_eq!(run_output("print(5 / 2); print(4 / 2);"), "2.5\n2\n");
}

#[test]
fn mixed_numeric_addition_commutes() {
    assert_eq!(run_output("print(2 + 3.5 == 3.5 + 2);"), "true\n");
}

#[test]
fn string_concatenation_and_comparison() {
    assert_eq!(run_output(r#"print("ab" + "cd", "a" < "b");"#), "abcd true\n");
}

#[test]
fn increment_forms_on_locals_indices_and_fields() {
    let source = r#"
        let i = 5; print(i++); print(i); print(++i);
        let a = [1, 2]; print(a[0]++); print(a[0]);
        let o = {n: 7}; print(o.n--); print(o.n);
    "#;
    assert_eq!(run_output(source), "5\n6\n7\n1\n2\n7\n6\n");
}

#[test]
fn optional_chain_and_null_coalesce() {
    let source = r#"
        let missing = null;
        let p = {x: 5, m: fn() { return 9; }};
        print(missing?.x);
        print(p?.x);
        print(missing?.m());
        print(p?.m());
        print(null ?? 3);
        print(4 ?? 5);
    "#;
    assert_eq!(run_output(source), "null\n5\nnull\n9\n3\n4\n");
}

#[test]
fn string_interpolation_coerces_parts() {
    let source = r#"
        let n = 3;
        print("n=${n + 1}! pi=${3.5}");
    "#;
    assert_eq!(run_output(source), "n=4! pi=3.5\n");
}

// ----- indexing boundaries -----

#[test]
fn array_reads_out_of_bounds_return_null_and_writes_grow() {
    let source = r#"
        let a = [1, 2];
        print(a[2]);
        print(a[-1]);
        a[4] = 9;
        print(a.length);
        print(a[3]);
        print(a[4]);
    "#;
    assert_eq!(run_output(source), "null\nnull\n5\nnull\n9\n");
}

#[test]
fn string_indexing_is_codepoint_based() {
    let source = r#"
        let s = "héllo";
        print(s.length);
        print(s[1]);
        print(s.byte_at(1));
        print(s[99]);
        print(s.char_at(4));
    "#;
    assert_eq!(run_output(source), "5\né\n195\nnull\no\n");
}

// ----- objects, methods, types -----

#[test]
fn object_methods_bind_self() {
    let source = r#"
        let obj = {
            count: 0,
            bump: fn() { self.count = self.count + 1; return self.count; }
        };
        print(obj.bump());
        print(obj.bump());
        print(obj.count);
    "#;
    assert_eq!(run_output(source), "1\n2\n2\n");
}

#[test]
fn typeof_reports_declared_object_type() {
    let source = r#"
        let p: Point = {x: 1, y: 2};
        let plain = {x: 1};
        print(typeof(p), typeof(plain), typeof([1]), typeof("s"), typeof(1), typeof(1.5));
    "#;
    assert_eq!(run_output(source), "Point object array string i32 f64\n");
}

#[test]
fn cast_annotation_changes_runtime_type() {
    assert_eq!(run_output("let x: i64 = 5; print(typeof(x));"), "i64\n");
    assert_eq!(run_output("let y: u8 = 300; print(y);"), "44\n");
}

#[test]
fn serialize_then_deserialize_round_trips() {
    let source = r#"
        let o = {b: 1, a: "x", nested: {k: [1, 2]}};
        let s = o.serialize();
        print(s);
        let o2 = s.deserialize();
        print(o2.a, o2.nested.k[1]);
    "#;
    assert_eq!(
        run_output(source),
        "{\"b\":1,\"a\":\"x\",\"nested\":{\"k\":[1,2]}}\nx 2\n"
    );
}

#[test]
fn object_keys_and_has_follow_insertion_order() {
    let source = r#"
        let o = {z: 1, a: 2};
        print(o.keys());
        print(o.has("z"), o.has("q"));
    "#;
    assert_eq!(run_output(source), "[\"z\", \"a\"]\ntrue false\n");
}

#[test]
fn enum_lowering_auto_increments_from_explicit_values() {
    let source = r#"
        enum Color { Red, Green = 5, Blue }
        print(Color.Red, Color.Green, Color.Blue);
    "#;
    assert_eq!(run_output(source), "0 5 6\n");
}

// ----- arrays -----

#[test]
fn double_reverse_restores_content() {
    let source = r#"
        let a = [1, 2, 3];
        a.reverse();
        a.reverse();
        print(a);
    "#;
    assert_eq!(run_output(source), "[1, 2, 3]\n");
}

#[test]
fn array_mutators_and_accessors() {
    let source = r#"
        let a = [2, 3];
        a.push(4);
        a.unshift(1);
        print(a, a.first(), a.last(), a.contains(3));
        print(a.pop(), a.shift(), a);
        a.insert(1, 99);
        print(a.remove(0), a);
        print([1,2,3].slice(1), [1].concat([2, 3]));
    "#;
    assert_eq!(
        run_output(source),
        "[1, 2, 3, 4] 1 4 true\n4 1 [2, 3]\n2 [99, 3]\n[2, 3] [1, 2, 3]\n"
    );
}

#[test]
fn reduce_of_empty_array_without_initial_throws() {
    let source = r#"
        try { [].reduce(fn(a, b) { return a + b; }); } catch (e) { print(e); }
    "#;
    assert_eq!(run_output(source), "Reduce of empty array with no initial value\n");
}

#[test]
fn string_split_join_round_trip() {
    let source = r#"
        let parts = "a,b,c".split(",");
        print(parts.length, parts.join("-"));
    "#;
    assert_eq!(run_output(source), "3 a-b-c\n");
}

// ----- async -----

#[test]
fn buffered_channel_send_then_recv_returns_value() {
    let source = r#"
        let ch = channel(2);
        ch.send(1);
        ch.send(2);
        print(ch.recv(), ch.recv());
    "#;
    assert_eq!(run_output(source), "1 2\n");
}

#[test]
fn closed_channel_recv_returns_null_and_send_throws() {
    let source = r#"
        let ch = channel(2);
        ch.send(7);
        ch.close();
        print(ch.recv());
        print(ch.recv());
        try { ch.send(1); } catch (e) { print(e); }
    "#;
    assert_eq!(run_output(source), "7\nnull\nCannot send on closed channel\n");
}

#[test]
fn task_exception_rethrown_on_join() {
    let source = r#"
        let t = spawn(async fn() { throw "task boom"; });
        try { join(t); } catch (e) { print("caught", e); }
    "#;
    assert_eq!(run_output(source), "caught task boom\n");
}

#[test]
fn await_keyword_blocks_on_task_result() {
    let source = r#"
        let t = spawn(async fn() { return 7; });
        print(await t);
    "#;
    assert_eq!(run_output(source), "7\n");
}

#[test]
fn task_arguments_are_deep_copied() {
    let source = r#"
        let data = [1, 2, 3];
        let t = spawn(async fn(xs) { xs.push(99); return xs.length; }, data);
        print(join(t));
        print(data.length);
    "#;
    assert_eq!(run_output(source), "4\n3\n");
}

#[test]
fn second_join_errors_and_detach_after_join_errors() {
    let source = r#"
        let t = spawn(async fn() { return 1; });
        join(t);
        try { join(t); } catch (e) { print(e); }
        try { detach(t); } catch (e) { print(e); }
    "#;
    assert_eq!(run_output(source), "Task already joined\nCannot detach joined task\n");
}

#[test]
fn select_returns_ready_channel_value_or_null_on_timeout() {
    let source = r#"
        let a = channel(1);
        let b = channel(1);
        b.send(9);
        let r = select([a, b], 200);
        print(r.value);
        print(select([a], 10));
    "#;
    assert_eq!(run_output(source), "9\nnull\n");
}

// ----- memory -----

#[test]
fn double_free_of_array_is_detected() {
    let source = r#"
        let a = [1];
        free(a);
        try { free(a); } catch (e) { print(e); }
    "#;
    assert_eq!(run_output(source), "Double free of array\n");
}

#[test]
fn pointer_round_trip_through_alloc() {
    let source = r#"
        let p = alloc(16);
        ptr_write_i32(p, 1234);
        ptr_write_i32(ptr_offset(p, 4), 77);
        print(ptr_read_i32(p), ptr_read_i32(ptr_offset(p, 4)));
        free(p);
    "#;
    assert_eq!(run_output(source), "1234 77\n");
}

#[test]
fn buffer_indexing_and_bounds() {
    let source = r#"
        let b = buffer(4);
        b[0] = 65;
        print(b[0], b.length);
        try { let x = b[9]; } catch (e) { print(e); }
    "#;
    assert_eq!(run_output(source), "65 4\nBuffer index out of bounds\n");
}

// ----- builtins through values -----

#[test]
fn apply_invokes_function_with_array_args() {
    let source = r#"
        let add = fn(a, b) { return a + b; };
        print(apply(add, [3, 4]));
    "#;
    assert_eq!(run_output(source), "7\n");
}

#[test]
fn builtins_are_first_class_values() {
    let source = r#"
        let f = sha256;
        print(typeof(f));
        let digest = f("abc");
        print(digest.length);
    "#;
    // sha256("abc") is 32 bytes -> 64 hex chars
    assert_eq!(run_output(source), "fn\n64\n");
}

#[test]
fn global_builtin_can_be_shadowed() {
    let source = r#"
        let sleep = fn(n) { return n * 2; };
        print(sleep(21));
    "#;
    assert_eq!(run_output(source), "42\n");
}

#[test]
fn result_global_survives_execution() {
    let value = run_global("let answer = 40 + 2;", "answer");
    assert_eq!(format_value(&value), "42");
}
