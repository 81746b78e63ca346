//! Pong physics - playfield constants and the synchronous per-tick step
//!
//! Velocities are expressed in pixels per tick at the fixed 60 Hz cadence,
//! matching the reference behavior. All functions here are pure over the
//! passed-in state; the match tick loop is the only caller.

use crate::ws::protocol::{BallSnapshot, PaddleDir, PaddleSnapshot, Side};

pub const FIELD_WIDTH: f32 = 800.0;
pub const FIELD_HEIGHT: f32 = 400.0;

pub const BALL_RADIUS: f32 = 10.0;
/// Serve speed per axis; sign is randomized at each serve
pub const SERVE_SPEED: f32 = 7.0;
/// Both velocity components scale by this on every paddle hit, so rallies
/// get harder the longer they last
pub const RALLY_ACCEL: f32 = 1.05;

pub const PADDLE_WIDTH: f32 = 10.0;
pub const PADDLE_HEIGHT: f32 = 75.0;
pub const PADDLE_SPEED: f32 = 5.0;
/// Fixed paddle x positions: A defends the left goal, B the right
pub const PADDLE_X_A: f32 = 10.0;
pub const PADDLE_X_B: f32 = 780.0;

impl PaddleDir {
    /// Velocity in px/tick for this command
    pub fn velocity(self) -> f32 {
        match self {
            PaddleDir::Up => -PADDLE_SPEED,
            PaddleDir::Down => PADDLE_SPEED,
            PaddleDir::Stop => 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Ball {
    pub x: f32,
    pub y: f32,
    pub dx: f32,
    pub dy: f32,
    pub radius: f32,
}

impl Ball {
    /// A stationary ball at field center
    pub fn centered() -> Self {
        Self {
            x: FIELD_WIDTH / 2.0,
            y: FIELD_HEIGHT / 2.0,
            dx: 0.0,
            dy: 0.0,
            radius: BALL_RADIUS,
        }
    }

    /// Recenter and freeze; used entering any countdown
    pub fn reset(&mut self) {
        *self = Self::centered();
    }

    pub fn snapshot(&self) -> BallSnapshot {
        BallSnapshot {
            x: self.x,
            y: self.y,
            dx: self.dx,
            dy: self.dy,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Paddle {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub velocity: f32,
}

impl Paddle {
    pub fn new(side: Side) -> Self {
        Self {
            x: match side {
                Side::A => PADDLE_X_A,
                Side::B => PADDLE_X_B,
            },
            y: (FIELD_HEIGHT - PADDLE_HEIGHT) / 2.0,
            width: PADDLE_WIDTH,
            height: PADDLE_HEIGHT,
            velocity: 0.0,
        }
    }

    pub fn snapshot(&self) -> PaddleSnapshot {
        PaddleSnapshot {
            y: self.y,
            velocity: self.velocity,
        }
    }
}

/// Integrate one paddle by its current velocity and clamp to the playfield
pub fn integrate_paddle(paddle: &mut Paddle) {
    paddle.y += paddle.velocity;
    paddle.y = paddle.y.clamp(0.0, FIELD_HEIGHT - paddle.height);
}

/// Integrate the ball and resolve wall/paddle collisions for one tick
pub fn integrate_ball(ball: &mut Ball, paddle_a: &Paddle, paddle_b: &Paddle) {
    ball.x += ball.dx;
    ball.y += ball.dy;

    // Top/bottom walls reflect vertically
    if ball.y - ball.radius <= 0.0 || ball.y + ball.radius >= FIELD_HEIGHT {
        ball.dy = -ball.dy;
    }

    // Left paddle: only deflects a ball moving toward it
    if ball.dx < 0.0
        && ball.x - ball.radius <= paddle_a.x + paddle_a.width
        && ball.y >= paddle_a.y
        && ball.y <= paddle_a.y + paddle_a.height
    {
        ball.dx = ball.dx.abs() * RALLY_ACCEL;
        ball.dy *= RALLY_ACCEL;
    }

    // Right paddle
    if ball.dx > 0.0
        && ball.x + ball.radius >= paddle_b.x
        && ball.y >= paddle_b.y
        && ball.y <= paddle_b.y + paddle_b.height
    {
        ball.dx = -ball.dx.abs() * RALLY_ACCEL;
        ball.dy *= RALLY_ACCEL;
    }
}

/// Goal-line detection: the side that scored, if the ball crossed out
pub fn goal_scored(ball: &Ball) -> Option<Side> {
    if ball.x - ball.radius <= 0.0 {
        // Past the left edge: B scored
        Some(Side::B)
    } else if ball.x + ball.radius >= FIELD_WIDTH {
        Some(Side::A)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paddle_clamps_to_vertical_bounds() {
        let mut paddle = Paddle::new(Side::A);

        paddle.velocity = -PADDLE_SPEED;
        for _ in 0..200 {
            integrate_paddle(&mut paddle);
            assert!(paddle.y >= 0.0);
        }
        assert_eq!(paddle.y, 0.0);

        paddle.velocity = PADDLE_SPEED;
        for _ in 0..200 {
            integrate_paddle(&mut paddle);
            assert!(paddle.y <= FIELD_HEIGHT - PADDLE_HEIGHT);
        }
        assert_eq!(paddle.y, FIELD_HEIGHT - PADDLE_HEIGHT);
    }

    #[test]
    fn ball_reflects_off_top_wall() {
        let (a, b) = (Paddle::new(Side::A), Paddle::new(Side::B));
        let mut ball = Ball::centered();
        ball.y = BALL_RADIUS + 2.0;
        ball.dx = 0.0;
        ball.dy = -7.0;

        integrate_ball(&mut ball, &a, &b);
        assert_eq!(ball.dy, 7.0);
    }

    #[test]
    fn paddle_hit_reverses_and_accelerates() {
        let (a, b) = (Paddle::new(Side::A), Paddle::new(Side::B));
        let mut ball = Ball::centered();
        ball.x = PADDLE_X_A + PADDLE_WIDTH + BALL_RADIUS + 3.0;
        ball.y = a.y + a.height / 2.0;
        ball.dx = -7.0;
        ball.dy = 7.0;

        integrate_ball(&mut ball, &a, &b);
        assert!(ball.dx > 0.0);
        assert!((ball.dx - 7.0 * RALLY_ACCEL).abs() < 1e-4);
        assert!((ball.dy - 7.0 * RALLY_ACCEL).abs() < 1e-4);
    }

    #[test]
    fn ball_passing_above_paddle_is_not_deflected() {
        let (a, b) = (Paddle::new(Side::A), Paddle::new(Side::B));
        let mut ball = Ball::centered();
        ball.x = PADDLE_X_A + PADDLE_WIDTH + BALL_RADIUS + 3.0;
        ball.y = a.y - 30.0;
        ball.dx = -7.0;
        ball.dy = 0.0;

        integrate_ball(&mut ball, &a, &b);
        assert!(ball.dx < 0.0);
    }

    #[test]
    fn goal_detection_matches_scoring_side() {
        let mut ball = Ball::centered();
        assert_eq!(goal_scored(&ball), None);

        ball.x = BALL_RADIUS - 1.0;
        assert_eq!(goal_scored(&ball), Some(Side::B));

        ball.x = FIELD_WIDTH - BALL_RADIUS + 1.0;
        assert_eq!(goal_scored(&ball), Some(Side::A));
    }

    #[test]
    fn reset_recenters_and_freezes() {
        let mut ball = Ball {
            x: 3.0,
            y: 9.0,
            dx: 12.0,
            dy: -4.0,
            radius: BALL_RADIUS,
        };
        ball.reset();
        assert_eq!(ball.x, FIELD_WIDTH / 2.0);
        assert_eq!(ball.y, FIELD_HEIGHT / 2.0);
        assert_eq!((ball.dx, ball.dy), (0.0, 0.0));
    }
}
