//! End-to-end scenarios: source text all the way through the VM, exercising
//! loops, compile-time-known arrays, and multi-input arithmetic that the
//! per-module unit tests elsewhere don't cover on their own.

use crate::front::parse::parse;
use crate::middle::{lower::lower, regalloc::allocate};
use crate::vm::Vm;

fn run(src: &str, inputs: &[i64]) -> Vec<i64> {
    let ast = parse(src).expect("parses");
    let lir = lower(&ast).expect("lowers");
    let allocation = allocate(lir).expect("allocates");
    let program = super::asm::assemble(&allocation);

    let mut vm = Vm::new(&program);
    let mut outputs = Vec::new();
    let mut iter = inputs.iter().copied();
    vm.run(&mut iter, &mut |v| outputs.push(v)).expect("runs to completion");
    outputs
}

#[test]
fn fibonacci_like_loop_over_two_seeds() {
    let src = "PROGRAM IS a, b, t, i IN \
        READ a; READ b; \
        i := 0; \
        WHILE i < 23 DO \
            t := a + b; \
            a := b; \
            b := t; \
            i := i + 1; \
        ENDWHILE \
        WRITE b; \
        WRITE a; \
        END";
    assert_eq!(run(src, &[0, 1]), vec![46368, 28657]);
}

#[test]
fn compile_time_sort_then_sentinel_then_index_run() {
    let values = [5, 7, 6, 5, 7, 6, 5, 7, 6, 5, 7, 6, 5, 7, 6, 5, 7, 6, 5, 7, 6, 5, 7];
    assert_eq!(values.len(), 23);

    let assigns: String = values.iter().enumerate().map(|(i, v)| format!("arr[{i}] := {v}; ")).collect();
    let src = format!(
        "PROGRAM IS arr[23], limit, j, jp1, tmp, i IN \
            {assigns} \
            limit := 22; \
            WHILE limit > 0 DO \
                j := 0; \
                WHILE j < limit DO \
                    jp1 := j + 1; \
                    IF arr[jp1] < arr[j] THEN \
                        tmp := arr[j]; \
                        arr[j] := arr[jp1]; \
                        arr[jp1] := tmp; \
                    ENDIF \
                    j := j + 1; \
                ENDWHILE \
                limit := limit - 1; \
            ENDWHILE \
            i := 0; \
            WHILE i < 23 DO \
                WRITE arr[i]; \
                i := i + 1; \
            ENDWHILE \
            WRITE 1234567890; \
            i := 0; \
            WHILE i < 23 DO \
                WRITE i; \
                i := i + 1; \
            ENDWHILE \
            END"
    );

    let mut expected = values;
    expected.sort();
    let mut want: Vec<i64> = expected.to_vec();
    want.push(1234567890);
    want.extend(0..23);

    let outputs = run(&src, &[]);
    assert_eq!(outputs, want);
    assert_eq!(outputs[0], 5);
    assert_eq!(outputs[22], 7);
}

#[test]
fn modular_exponentiation_by_squaring() {
    let src = "PROGRAM IS base, exp, m, result, t IN \
        READ base; READ exp; READ m; \
        result := 1; \
        base := base % m; \
        WHILE exp > 0 DO \
            t := exp % 2; \
            IF t != 0 THEN \
                result := result * base; \
                result := result % m; \
            ENDIF \
            base := base * base; \
            base := base % m; \
            exp := exp / 2; \
        ENDWHILE \
        WRITE result; \
        END";
    let outputs = run(src, &[1234567890, 1234567890987654321, 987654321]);
    assert_eq!(outputs, vec![674106858]);
}

#[test]
fn empty_procedure_body_still_links_back_to_its_caller() {
    let src = "PROCEDURE noop() IS IN END \
               PROGRAM IS a IN a := 7; noop(); WRITE a; END";
    assert_eq!(run(src, &[]), vec![7]);
}
