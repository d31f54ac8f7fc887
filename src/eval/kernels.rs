//! Numerical routines shared by every backend.
//!
//! Forward kernels overwrite `out` completely. Backward kernels accumulate into
//! `grad`, which the graph hands over zero-initialized.

use num_traits::Float;
use rayon::prelude::*;

use crate::{prod, Conv2dParams, Element, OpKind};

/// Read-only operand of a kernel
#[derive(Clone, Copy)]
pub struct Operand<'a, T> {
    pub data: &'a [T],
    pub shape: &'a [usize],
}

fn unop<T: Element>(d: &mut [T], s: &[T], par: bool, op: impl Fn(T) -> T + Sync + Send) {
    if par {
        d.par_iter_mut().zip(s.par_iter()).for_each(|(d, s)| *d = op(*s));
    } else {
        for (d, s) in d.iter_mut().zip(s.iter()) {
            *d = op(*s);
        }
    }
}

fn binop<T: Element>(d: &mut [T], s1: &[T], s2: &[T], par: bool, op: impl Fn(T, T) -> T + Sync + Send) {
    if par {
        d.par_iter_mut()
            .zip(s1.par_iter().zip(s2.par_iter()))
            .for_each(|(d, (s1, s2))| *d = op(*s1, *s2));
    } else {
        for (d, (s1, s2)) in d.iter_mut().zip(s1.iter().zip(s2.iter())) {
            *d = op(*s1, *s2);
        }
    }
}

/// `d += op(s)`
fn acc_unop<T: Element>(d: &mut [T], s: &[T], par: bool, op: impl Fn(T) -> T + Sync + Send) {
    if par {
        d.par_iter_mut().zip(s.par_iter()).for_each(|(d, s)| *d = *d + op(*s));
    } else {
        for (d, s) in d.iter_mut().zip(s.iter()) {
            *d = *d + op(*s);
        }
    }
}

/// `d += op(s1, s2)`
fn acc_binop<T: Element>(d: &mut [T], s1: &[T], s2: &[T], par: bool, op: impl Fn(T, T) -> T + Sync + Send) {
    if par {
        d.par_iter_mut()
            .zip(s1.par_iter().zip(s2.par_iter()))
            .for_each(|(d, (s1, s2))| *d = *d + op(*s1, *s2));
    } else {
        for (d, (s1, s2)) in d.iter_mut().zip(s1.iter().zip(s2.iter())) {
            *d = *d + op(*s1, *s2);
        }
    }
}

fn cast<T: Element>(v: f64) -> T {
    T::from_f64(v).unwrap_or_else(T::nan)
}

/// Split `shape` around `axis` into `(outer, len, inner)`
fn around(shape: &[usize], axis: Option<usize>) -> (usize, usize, usize) {
    match axis {
        None => (1, prod(shape), 1),
        Some(a) => (prod(&shape[..a]), shape[a], prod(&shape[a + 1..])),
    }
}

fn reduce_sum<T: Element>(out: &mut [T], x: Operand<T>, axis: Option<usize>) {
    let (outer, len, inner) = around(x.shape, axis);
    out.fill(T::zero());
    for o in 0..outer {
        for l in 0..len {
            let row = &x.data[(o * len + l) * inner..][..inner];
            for (d, s) in out[o * inner..][..inner].iter_mut().zip(row) {
                *d = *d + *s;
            }
        }
    }
}

fn reduce_sum_grad<T: Element>(grad: &mut [T], shape: &[usize], axis: Option<usize>, upstream: &[T]) {
    let (outer, len, inner) = around(shape, axis);
    for o in 0..outer {
        for l in 0..len {
            let row = &mut grad[(o * len + l) * inner..][..inner];
            for (d, s) in row.iter_mut().zip(&upstream[o * inner..][..inner]) {
                *d = *d + *s;
            }
        }
    }
}

/// Dense `c += op(a) * op(b)` where `c` is `[m, n]` row-major and the shared
/// dimension is `k`. A transposed operand is stored the other way around.
///
/// `f32` and `f64` go through `matrixmultiply`, anything else falls back to a
/// row loop.
pub trait Gemm: Float + Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn gemm(c: &mut [Self], a: &[Self], ta: bool, b: &[Self], tb: bool, m: usize, k: usize, n: usize, par: bool) {
        gemm_rows(c, a, ta, b, tb, m, k, n, par)
    }
}

#[allow(clippy::too_many_arguments)]
fn gemm_rows<T: Float + Send + Sync>(
    c: &mut [T],
    a: &[T],
    ta: bool,
    b: &[T],
    tb: bool,
    m: usize,
    k: usize,
    n: usize,
    par: bool,
) {
    let row = |i: usize, crow: &mut [T]| {
        for p in 0..k {
            let av = if ta { a[p * m + i] } else { a[i * k + p] };
            for (j, cv) in crow.iter_mut().enumerate() {
                let bv = if tb { b[j * k + p] } else { b[p * n + j] };
                *cv = *cv + av * bv;
            }
        }
    };
    if par {
        c.par_chunks_mut(n).enumerate().for_each(|(i, crow)| row(i, crow));
    } else {
        c.chunks_mut(n).enumerate().for_each(|(i, crow)| row(i, crow));
    }
}

/// Row and column stride of a logical `[rows, cols]` operand
fn strides(transposed: bool, rows: usize, cols: usize) -> (isize, isize) {
    if transposed {
        (1, rows as isize)
    } else {
        (cols as isize, 1)
    }
}

macro_rules! matrixmultiply_gemm {
    ($t:ty, $f:path) => {
        impl Gemm for $t {
            #[allow(clippy::too_many_arguments)]
            fn gemm(c: &mut [Self], a: &[Self], ta: bool, b: &[Self], tb: bool, m: usize, k: usize, n: usize, _par: bool) {
                assert!(a.len() >= m * k && b.len() >= k * n && c.len() >= m * n);
                let (rsa, csa) = strides(ta, m, k);
                let (rsb, csb) = strides(tb, k, n);
                // SAFETY: every offset the strides reach lies within the checked lengths
                unsafe {
                    $f(
                        m,
                        k,
                        n,
                        1.0,
                        a.as_ptr(),
                        rsa,
                        csa,
                        b.as_ptr(),
                        rsb,
                        csb,
                        1.0,
                        c.as_mut_ptr(),
                        n as isize,
                        1,
                    );
                }
            }
        }
    };
}

matrixmultiply_gemm!(f32, matrixmultiply::sgemm);
matrixmultiply_gemm!(f64, matrixmultiply::dgemm);

/// Visit every `(input, filter, output)` flat index triple contributing to a
/// convolution. Taps that fall into the padding are skipped.
fn conv_walk(x: &[usize], w: &[usize], y: &[usize], p: &Conv2dParams, mut f: impl FnMut(usize, usize, usize)) {
    let (n, c, h, wd) = (x[0], x[1], x[2], x[3]);
    let (k, kh, kw) = (w[0], w[2], w[3]);
    let (oh, ow) = (y[2], y[3]);

    for b in 0..n {
        for ko in 0..k {
            for oy in 0..oh {
                for ox in 0..ow {
                    let yi = ((b * k + ko) * oh + oy) * ow + ox;
                    for ci in 0..c {
                        for ky in 0..kh {
                            let iy = (oy * p.stride_h + ky * (p.dilation_h + 1)) as isize - p.pad_h as isize;
                            if iy < 0 || iy as usize >= h {
                                continue;
                            }
                            for kx in 0..kw {
                                let ix = (ox * p.stride_w + kx * (p.dilation_w + 1)) as isize - p.pad_w as isize;
                                if ix < 0 || ix as usize >= wd {
                                    continue;
                                }
                                let (fy, fx) = if p.cross_correlation {
                                    (ky, kx)
                                } else {
                                    (kh - 1 - ky, kw - 1 - kx)
                                };
                                let xi = ((b * c + ci) * h + iy as usize) * wd + ix as usize;
                                let wi = ((ko * c + ci) * kh + fy) * kw + fx;
                                f(xi, wi, yi);
                            }
                        }
                    }
                }
            }
        }
    }
}

/// `(rows, cols)` of the per-sample view used by softmax
fn samples(shape: &[usize]) -> (usize, usize) {
    let rows = shape[0];
    (rows, prod(shape) / rows)
}

pub fn forward<T: Element>(op: &OpKind, inputs: &[Operand<T>], out: &mut [T], out_shape: &[usize], par: bool) {
    match op {
        OpKind::Value(_) => {}
        OpKind::Neg => unop(out, inputs[0].data, par, |a| -a),
        OpKind::Add => binop(out, inputs[0].data, inputs[1].data, par, |a, b| a + b),
        OpKind::Mul => binop(out, inputs[0].data, inputs[1].data, par, |a, b| a * b),
        OpKind::Pow { power } => {
            let power = *power;
            unop(out, inputs[0].data, par, move |a| a.powi(power))
        }
        OpKind::Scale { alpha } => {
            let alpha: T = cast(*alpha);
            unop(out, inputs[0].data, par, move |a| alpha * a)
        }
        OpKind::ReduceSum { axis } => reduce_sum(out, inputs[0], *axis),
        OpKind::MatMul => {
            let (a, b) = (inputs[0], inputs[1]);
            out.fill(T::zero());
            T::gemm(out, a.data, false, b.data, false, a.shape[0], a.shape[1], b.shape[1], par);
        }
        OpKind::Conv2d(p) => {
            let (x, w) = (inputs[0], inputs[1]);
            out.fill(T::zero());
            conv_walk(x.shape, w.shape, out_shape, p, |xi, wi, yi| {
                out[yi] = out[yi] + x.data[xi] * w.data[wi];
            });
        }
        OpKind::Relu => unop(out, inputs[0].data, par, |a| a.max(T::zero())),
        OpKind::Sigmoid => unop(out, inputs[0].data, par, |a| T::one() / (T::one() + (-a).exp())),
        OpKind::Softmax => {
            let (_, cols) = samples(out_shape);
            for (d, s) in out.chunks_mut(cols).zip(inputs[0].data.chunks(cols)) {
                let max = s.iter().copied().fold(T::neg_infinity(), T::max);
                for (d, s) in d.iter_mut().zip(s) {
                    *d = (*s - max).exp();
                }
                let sum: T = d.iter().copied().sum();
                d.iter_mut().for_each(|v| *v = *v / sum);
            }
        }
        OpKind::CrossEntropy => {
            let (pred, gt) = (inputs[0], inputs[1]);
            let n: T = cast(pred.shape[0] as f64);
            let total: T = pred.data.iter().zip(gt.data).map(|(p, g)| *g * p.ln()).sum();
            out[0] = -total / n;
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub fn backward<T: Element>(
    op: &OpKind,
    slot: usize,
    inputs: &[Operand<T>],
    output: &[T],
    out_shape: &[usize],
    upstream: &[T],
    grad: &mut [T],
    par: bool,
) {
    match op {
        OpKind::Value(_) => {}
        OpKind::Neg => acc_unop(grad, upstream, par, |g| -g),
        OpKind::Add => acc_unop(grad, upstream, par, |g| g),
        OpKind::Mul => acc_binop(grad, upstream, inputs[1 - slot].data, par, |g, o| g * o),
        // constant, and 0 * x^-1 would be NaN at x = 0
        OpKind::Pow { power: 0 } => {}
        OpKind::Pow { power } => {
            let power = *power;
            let pw: T = cast(power as f64);
            acc_binop(grad, upstream, inputs[0].data, par, move |g, x| g * pw * x.powi(power - 1))
        }
        OpKind::Scale { alpha } => {
            let alpha: T = cast(*alpha);
            acc_unop(grad, upstream, par, move |g| g * alpha)
        }
        OpKind::ReduceSum { axis } => reduce_sum_grad(grad, inputs[0].shape, *axis, upstream),
        OpKind::MatMul => {
            let (a, b) = (inputs[0], inputs[1]);
            let (m, k, n) = (a.shape[0], a.shape[1], b.shape[1]);
            if slot == 0 {
                // dA = G * B'
                T::gemm(grad, upstream, false, b.data, true, m, n, k, par);
            } else {
                // dB = A' * G
                T::gemm(grad, a.data, true, upstream, false, k, m, n, par);
            }
        }
        OpKind::Conv2d(p) => {
            let (x, w) = (inputs[0], inputs[1]);
            if slot == 0 {
                conv_walk(x.shape, w.shape, out_shape, p, |xi, wi, yi| {
                    grad[xi] = grad[xi] + w.data[wi] * upstream[yi];
                });
            } else {
                conv_walk(x.shape, w.shape, out_shape, p, |xi, wi, yi| {
                    grad[wi] = grad[wi] + x.data[xi] * upstream[yi];
                });
            }
        }
        OpKind::Relu => acc_binop(grad, upstream, inputs[0].data, par, |g, x| {
            if x > T::zero() {
                g
            } else {
                T::zero()
            }
        }),
        OpKind::Sigmoid => acc_binop(grad, upstream, output, par, |g, y| g * y * (T::one() - y)),
        OpKind::Softmax => {
            let (_, cols) = samples(out_shape);
            for ((d, y), g) in grad.chunks_mut(cols).zip(output.chunks(cols)).zip(upstream.chunks(cols)) {
                let dot: T = y.iter().zip(g).map(|(y, g)| *y * *g).sum();
                for ((d, y), g) in d.iter_mut().zip(y).zip(g) {
                    *d = *d + *y * (*g - dot);
                }
            }
        }
        OpKind::CrossEntropy => {
            let (pred, gt) = (inputs[0], inputs[1]);
            let n: T = cast(pred.shape[0] as f64);
            let scale = -upstream[0] / n;
            if slot == 0 {
                acc_binop(grad, gt.data, pred.data, par, move |g, p| scale * g / p);
            } else {
                acc_unop(grad, pred.data, par, move |p| scale * p.ln());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op<'a>(data: &'a [f64], shape: &'a [usize]) -> Operand<'a, f64> {
        Operand { data, shape }
    }

    #[test]
    fn reduce_along_axis() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut out = [0.0; 3];
        forward(&OpKind::ReduceSum { axis: Some(0) }, &[op(&x, &[2, 3])], &mut out, &[3], false);
        assert_eq!(out, [5.0, 7.0, 9.0]);

        let mut out = [0.0; 2];
        forward(&OpKind::ReduceSum { axis: Some(1) }, &[op(&x, &[2, 3])], &mut out, &[2], true);
        assert_eq!(out, [6.0, 15.0]);

        let mut grad = [0.0; 6];
        backward(&OpKind::ReduceSum { axis: Some(1) }, 0, &[op(&x, &[2, 3])], &out, &[2], &[1.0, 2.0], &mut grad, false);
        assert_eq!(grad, [1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn gemm_and_its_gradients() {
        // [2,3] x [3,2]
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
        let ins = [op(&a, &[2, 3]), op(&b, &[3, 2])];
        let mut c = [0.0; 4];
        forward(&OpKind::MatMul, &ins, &mut c, &[2, 2], false);
        assert_eq!(c, [58.0, 64.0, 139.0, 154.0]);

        let g = [1.0; 4];
        let mut da = [0.0; 6];
        backward(&OpKind::MatMul, 0, &ins, &c, &[2, 2], &g, &mut da, false);
        // row sums of B
        assert_eq!(da, [15.0, 19.0, 23.0, 15.0, 19.0, 23.0]);

        let mut db = [0.0; 6];
        backward(&OpKind::MatMul, 1, &ins, &c, &[2, 2], &g, &mut db, true);
        // column sums of A
        assert_eq!(db, [5.0, 5.0, 7.0, 7.0, 9.0, 9.0]);
    }

    #[test]
    fn gemm_strides_match_row_loop() {
        let (m, k, n) = (3, 4, 5);
        let a: Vec<f32> = (0..m * k).map(|i| (i % 7) as f32 - 3.0).collect();
        let b: Vec<f32> = (0..k * n).map(|i| (i % 5) as f32 - 2.0).collect();
        for (ta, tb) in [(false, false), (true, false), (false, true), (true, true)] {
            let mut fast = vec![1.0f32; m * n];
            let mut rows = fast.clone();
            f32::gemm(&mut fast, &a, ta, &b, tb, m, k, n, false);
            gemm_rows(&mut rows, &a, ta, &b, tb, m, k, n, true);
            assert_eq!(fast, rows, "ta={ta} tb={tb}");
        }
    }

    #[test]
    fn zero_power_has_zero_gradient() {
        let x = [0.0, 2.0];
        let ins = [op(&x, &[2])];
        let mut y = [0.0; 2];
        forward(&OpKind::Pow { power: 0 }, &ins, &mut y, &[2], false);
        assert_eq!(y, [1.0, 1.0]);

        let mut g = [0.0; 2];
        backward(&OpKind::Pow { power: 0 }, 0, &ins, &y, &[2], &[1.0, 1.0], &mut g, false);
        assert_eq!(g, [0.0, 0.0]);
    }

    #[test]
    fn conv_identity_kernel() {
        let x: Vec<f64> = (0..9).map(f64::from).collect();
        let w = [0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0];
        let p = Conv2dParams {
            pad_h: 1,
            pad_w: 1,
            ..Default::default()
        };
        let mut y = [0.0; 9];
        forward(&OpKind::Conv2d(p), &[op(&x, &[1, 1, 3, 3]), op(&w, &[1, 1, 3, 3])], &mut y, &[1, 1, 3, 3], false);
        assert_eq!(y.to_vec(), x);
    }

    #[test]
    fn convolution_flips_kernel() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let w = [1.0, 0.0, 0.0, 0.0];
        let ins = [op(&x, &[1, 1, 2, 2]), op(&w, &[1, 1, 2, 2])];
        let mut y = [0.0];

        forward(&OpKind::Conv2d(Conv2dParams::default()), &ins, &mut y, &[1, 1, 1, 1], false);
        assert_eq!(y, [1.0]);

        let flip = Conv2dParams {
            cross_correlation: false,
            ..Default::default()
        };
        forward(&OpKind::Conv2d(flip), &ins, &mut y, &[1, 1, 1, 1], false);
        assert_eq!(y, [4.0]);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let x = [1.0, 2.0, 3.0, 1.0, 1.0, 1.0];
        let mut y = [0.0; 6];
        forward(&OpKind::Softmax, &[op(&x, &[2, 3])], &mut y, &[2, 3], false);
        assert!((y[..3].iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((y[3] - 1.0 / 3.0).abs() < 1e-12);

        // uniform upstream has zero gradient through softmax
        let mut g = [0.0; 6];
        backward(&OpKind::Softmax, 0, &[op(&x, &[2, 3])], &y, &[2, 3], &[1.0; 6], &mut g, false);
        assert!(g.iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn cross_entropy_value() {
        let pred = [0.5, 0.5, 0.25, 0.75];
        let gt = [1.0, 0.0, 0.0, 1.0];
        let mut out = [0.0];
        forward(&OpKind::CrossEntropy, &[op(&pred, &[2, 2]), op(&gt, &[2, 2])], &mut out, &[1], false);
        let expect = -(0.5f64.ln() + 0.75f64.ln()) / 2.0;
        assert!((out[0] - expect).abs() < 1e-12);
    }
}
